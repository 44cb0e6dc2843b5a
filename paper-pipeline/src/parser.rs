use crate::types::{Category, Item, PipelineError, Result};
use feed_rs::model::Entry;
use feed_rs::parser;
use tracing::{debug, info, warn};

/// Converts arXiv Atom responses into [`Item`]s.
pub struct ArxivParser;

impl ArxivParser {
    pub fn parse_feed(content: &str) -> Result<Vec<Item>> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| PipelineError::Parse(format!("Failed to parse feed: {}", e)))?;

        let total = feed.entries.len();
        let items: Vec<Item> = feed.entries.into_iter().filter_map(Self::parse_entry).collect();

        if items.len() < total {
            info!("Parsed {} of {} entries", items.len(), total);
        } else {
            debug!("Parsed {} entries", items.len());
        }
        Ok(items)
    }

    /// `None` for entries that cannot become an item: no id, no publication
    /// timestamp, or no category we recognise.
    pub fn parse_entry(entry: Entry) -> Option<Item> {
        let id = paper_id(&entry.id)?;

        let Some(published_at) = entry.published.or(entry.updated) else {
            warn!(item_id = %id, "Skipping entry without a publication timestamp");
            return None;
        };

        let Some(category) = entry.categories.iter().find_map(|c| c.term.parse::<Category>().ok()) else {
            warn!(item_id = %id, "Skipping entry without a recognised category");
            return None;
        };

        let title = entry.title.map(|t| normalize_whitespace(&t.content)).unwrap_or_default();
        let abstract_text = entry.summary.map(|s| normalize_whitespace(&s.content)).unwrap_or_default();
        let authors = entry.authors.into_iter().map(|p| p.name).collect();

        let pdf_url = entry
            .links
            .iter()
            .find(|l| l.title.as_deref() == Some("pdf") || l.media_type.as_deref() == Some("application/pdf"))
            .map(|l| l.href.clone());

        Some(Item {
            id,
            title,
            abstract_text,
            category,
            published_at,
            authors,
            pdf_url,
        })
    }
}

/// Last path segment of an entry id, version suffix kept:
/// `http://arxiv.org/abs/2401.01234v2` → `2401.01234v2`.
pub fn paper_id(entry_id: &str) -> Option<String> {
    let id = entry_id.trim().trim_end_matches('/').rsplit('/').next()?.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
