mod common;

use chrono::{TimeZone, Utc};
use common::{base_time, item};
use paper_pipeline::fetcher::filter_fetched;
use paper_pipeline::parser::{normalize_whitespace, paper_id};
use paper_pipeline::{ArxivFetcher, ArxivParser, Category, FileConfig};
use std::collections::HashSet;

const ARXIV_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <id>http://arxiv.org/api/query</id>
  <title>arXiv Query: cat:cs.AI</title>
  <updated>2025-03-14T00:00:00-04:00</updated>
  <entry>
    <id>http://arxiv.org/abs/2503.01234v2</id>
    <updated>2025-03-13T18:00:00Z</updated>
    <published>2025-03-13T17:59:00Z</published>
    <title>Agents That
      Plan   Ahead</title>
    <summary>  We show that a planner
      beats the baseline by 40%.
    </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2503.01234v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2503.01234v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2503.05678v1</id>
    <updated>2025-03-13T09:30:00Z</updated>
    <title>Unlisted Field</title>
    <summary>Nothing we track.</summary>
    <author><name>Someone</name></author>
    <category term="astro-ph.GA" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2503.09999v1</id>
    <updated>2025-03-12T08:00:00Z</updated>
    <title>Updated Only</title>
    <summary>No published element.</summary>
    <author><name>Grace Hopper</name></author>
    <category term="astro-ph.GA" scheme="http://arxiv.org/schemas/atom"/>
    <category term="stat.ML" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

#[test]
fn test_parse_arxiv_feed() {
    let items = ArxivParser::parse_feed(ARXIV_FEED).unwrap();
    assert_eq!(items.len(), 2);

    let first = &items[0];
    assert_eq!(first.id, "2503.01234v2");
    assert_eq!(first.title, "Agents That Plan Ahead");
    assert_eq!(first.abstract_text, "We show that a planner beats the baseline by 40%.");
    assert_eq!(first.category, Category::CsAi);
    assert_eq!(first.authors, vec!["Ada Lovelace", "Alan Turing"]);
    assert_eq!(first.pdf_url.as_deref(), Some("http://arxiv.org/pdf/2503.01234v2"));
    assert_eq!(first.published_at, Utc.with_ymd_and_hms(2025, 3, 13, 17, 59, 0).unwrap());

    // Falls back to `updated` and to the first category we track.
    let second = &items[1];
    assert_eq!(second.id, "2503.09999v1");
    assert_eq!(second.category, Category::StatMl);
    assert_eq!(second.published_at, Utc.with_ymd_and_hms(2025, 3, 12, 8, 0, 0).unwrap());
    assert!(second.pdf_url.is_none());
}

#[test]
fn test_parse_rejects_non_feed_content() {
    assert!(ArxivParser::parse_feed("<html><body>rate limited</body></html>").is_err());
    assert!(ArxivParser::parse_feed("").is_err());
}

#[test]
fn test_paper_id_keeps_version() {
    assert_eq!(paper_id("http://arxiv.org/abs/2401.01234v2").as_deref(), Some("2401.01234v2"));
    assert_eq!(paper_id("http://arxiv.org/abs/2401.01234/").as_deref(), Some("2401.01234"));
    assert_eq!(paper_id("2401.01234v1").as_deref(), Some("2401.01234v1"));
    assert_eq!(paper_id("   "), None);
}

#[test]
fn test_normalize_whitespace() {
    assert_eq!(normalize_whitespace("  a\n\tb   c  "), "a b c");
    assert_eq!(normalize_whitespace(""), "");
}

#[test]
fn test_filter_fetched_applies_window_and_dedup() {
    let since = base_time();
    let mut seen = HashSet::new();

    let first = filter_fetched(
        vec![item("new", 10), item("old", -10), item("new", 20), item("edge", 0)],
        since,
        &mut seen,
    );
    let ids: Vec<&str> = first.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "edge"]);

    // Cross-listed papers come back under a second category query.
    let second = filter_fetched(vec![item("new", 10), item("other", 5)], since, &mut seen);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, "other");
}

#[test]
fn test_query_url_targets_category_newest_first() {
    let config = FileConfig::parse("[catalog]\nmax_results_per_category = 25")
        .unwrap()
        .into_app_config()
        .unwrap();
    let fetcher = ArxivFetcher::new(config.catalog).unwrap();
    let url = fetcher.query_url(Category::CsCl).unwrap();

    assert_eq!(url.host_str(), Some("export.arxiv.org"));
    assert_eq!(url.path(), "/api/query");
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("search_query".to_string(), "cat:cs.CL".to_string())));
    assert!(pairs.contains(&("max_results".to_string(), "25".to_string())));
    assert!(pairs.contains(&("sortBy".to_string(), "submittedDate".to_string())));
    assert!(pairs.contains(&("sortOrder".to_string(), "descending".to_string())));
}
