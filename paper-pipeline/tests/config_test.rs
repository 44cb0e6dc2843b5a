use paper_pipeline::config::SELECTION_AXES;
use paper_pipeline::{load_config, AxisWeights, Category, FileConfig, PipelineConfig, PipelineError};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

const SAMPLE: &str = r#"
[pipeline]
top_k = 50
threshold = 60
high_bound = 85
max_retry_attempts = 5
retry_base_delay_ms = 250
per_call_timeout_secs = 30
run_deadline_secs = 3600

[catalog]
categories = ["cs.AI", "cs.CL"]
lookback_hours = 24

[oracle]
model = "gemini-2.5-pro"

[storage]
database_url = "sqlite::memory:"
"#;

fn config_error(content: &str) -> String {
    let result = FileConfig::parse(content).and_then(FileConfig::into_app_config);
    match result {
        Err(PipelineError::Config(message)) => message,
        other => panic!("expected a config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_sample_config_parses_with_defaults_filled_in() {
    let config = FileConfig::parse(SAMPLE).unwrap().into_app_config().unwrap();

    assert_eq!(config.pipeline.top_k, 50);
    assert_eq!(config.pipeline.threshold, 60);
    assert_eq!(config.pipeline.high_bound, 85);
    assert_eq!(config.pipeline.retry.max_attempts, 5);
    assert_eq!(config.pipeline.retry.base_delay, Duration::from_millis(250));
    assert_eq!(config.pipeline.per_call_timeout, Duration::from_secs(30));
    assert_eq!(config.pipeline.run_deadline, Duration::from_secs(3600));
    assert_eq!(config.pipeline.batch_parallelism, 4);
    assert_eq!(config.pipeline.max_failure_fraction, 0.2);
    assert_eq!(config.pipeline.weights, AxisWeights::default());

    assert_eq!(
        config.catalog.categories.iter().copied().collect::<Vec<_>>(),
        vec![Category::CsAi, Category::CsCl]
    );
    assert_eq!(config.catalog.lookback_hours, 24);
    assert_eq!(config.catalog.base_url, "https://export.arxiv.org/api/query");
    assert_eq!(config.oracle.model, "gemini-2.5-pro");
    assert_eq!(config.oracle.api_key_env, "GEMINI_API_KEY");
    assert_eq!(config.storage.database_url, "sqlite::memory:");
    assert_eq!(config.log_level, "info");
}

#[test]
fn test_empty_file_yields_validated_defaults() {
    let config = FileConfig::parse("").unwrap().into_app_config().unwrap();
    let defaults = PipelineConfig::default();
    assert_eq!(config.pipeline.top_k, defaults.top_k);
    assert_eq!(config.pipeline.threshold, 65);
    assert_eq!(config.pipeline.high_bound, 80);
    assert_eq!(config.pipeline.weights.total(), 100);
    assert!(defaults.validate().is_ok());
}

#[test]
fn test_default_weights_sum_to_one_hundred() {
    let total: u32 = SELECTION_AXES.iter().map(|(_, max)| max).sum();
    assert_eq!(total, 100);
    assert_eq!(AxisWeights::default().max_for("clickbait_potential"), Some(25));
    assert_eq!(AxisWeights::default().max_for("usefulness"), None);
}

#[test]
fn test_partial_weights_table_is_rejected() {
    let message = config_error(
        r#"
        [pipeline.weights]
        clickbait_potential = 30
        "#,
    );
    assert!(message.contains("missing weight"), "{}", message);
}

#[test]
fn test_custom_weights_move_the_ceiling() {
    let mut weights: BTreeMap<String, u32> = SELECTION_AXES.iter().map(|(a, m)| (a.to_string(), *m)).collect();
    weights.insert("clickbait_potential".to_string(), 5);
    let weights = AxisWeights::new(weights).unwrap();
    assert_eq!(weights.total(), 80);

    // high_bound 80 still fits, 85 no longer does.
    let config = PipelineConfig {
        weights: weights.clone(),
        ..PipelineConfig::default()
    };
    assert!(config.validate().is_ok());
    let config = PipelineConfig {
        weights,
        high_bound: 85,
        ..PipelineConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_axis_is_rejected() {
    let mut weights: BTreeMap<String, u32> = SELECTION_AXES.iter().map(|(a, m)| (a.to_string(), *m)).collect();
    weights.insert("memeability".to_string(), 10);
    assert!(matches!(AxisWeights::new(weights), Err(PipelineError::Config(_))));
}

#[test]
fn test_invalid_values_are_rejected() {
    assert!(config_error("[pipeline]\ntop_k = 0").contains("top_k"));
    assert!(config_error("[pipeline]\nthreshold = 80\nhigh_bound = 80").contains("below high_bound"));
    assert!(config_error("[pipeline]\nmax_failure_fraction = 1.5").contains("max_failure_fraction"));
    assert!(config_error("[pipeline]\nbatch_parallelism = 0").contains("batch_parallelism"));
    assert!(config_error("[pipeline]\nper_call_timeout_secs = 60\nrun_deadline_secs = 60").contains("run_deadline"));
    assert!(config_error("[catalog]\ncategories = []").contains("category"));
    assert!(config_error("[catalog]\nlookback_hours = 0").contains("lookback_hours"));
}

#[test]
fn test_unknown_fields_and_categories_are_rejected() {
    assert!(config_error("[pipeline]\ntopk = 10").contains("failed to parse"));
    assert!(config_error("[catalog]\ncategories = [\"astro-ph\"]").contains("astro-ph"));
    // Negative values do not fit unsigned fields.
    assert!(config_error("[pipeline]\ntop_k = -1").contains("failed to parse"));
}

#[test]
fn test_load_config_reads_file_and_reports_missing_file() {
    let path = std::env::temp_dir().join(format!("paper-pipeline-{}.toml", Uuid::new_v4()));
    std::fs::write(&path, SAMPLE).unwrap();
    let config = load_config(&path).unwrap();
    assert_eq!(config.pipeline.top_k, 50);
    std::fs::remove_file(&path).unwrap();

    match load_config(&path) {
        Err(PipelineError::Config(message)) => assert!(message.contains("failed to read")),
        other => panic!("expected a config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_shipped_config_matches_defaults() {
    let shipped = FileConfig::parse(include_str!("../../pipeline.toml")).unwrap().into_app_config().unwrap();
    let defaults = FileConfig::parse("").unwrap().into_app_config().unwrap();
    assert_eq!(shipped.pipeline.weights, defaults.pipeline.weights);
    assert_eq!(shipped.pipeline.retry, defaults.pipeline.retry);
    assert_eq!(shipped.catalog.categories, defaults.catalog.categories);
    assert_eq!(shipped.storage.database_url, defaults.storage.database_url);
}

#[test]
fn test_oversized_values_are_rejected_instead_of_overflowing() {
    let mut weights: BTreeMap<String, u32> = SELECTION_AXES.iter().map(|(a, m)| (a.to_string(), *m)).collect();
    weights.insert("clickbait_potential".to_string(), u32::MAX);
    weights.insert("life_impact".to_string(), u32::MAX);
    match AxisWeights::new(weights) {
        Err(PipelineError::Config(message)) => assert!(message.contains("overflow"), "{}", message),
        other => panic!("expected a config error, got {:?}", other),
    }

    let huge_weights = format!(
        "[pipeline.weights]\nclickbait_potential = {max}\nlife_impact = {max}\nhuman_comparison = 20\n\
         strong_numbers = 15\nuse_case = 10\nimplementation = 10",
        max = u32::MAX
    );
    assert!(config_error(&huge_weights).contains("overflow"));

    // TOML integers are i64, so i64::MAX is the largest value a file can carry.
    let max = i64::MAX;
    assert!(config_error(&format!("[pipeline]\nrun_deadline_secs = {}", max)).contains("run_deadline"));
    assert!(config_error(&format!(
        "[pipeline]\nper_call_timeout_secs = {}\nrun_deadline_secs = {}",
        max - 1,
        max
    ))
    .contains("run_deadline"));
    assert!(config_error(&format!("[pipeline]\nretry_base_delay_ms = {}", max)).contains("retry base delay"));
    assert!(config_error(&format!("[catalog]\nlookback_hours = {}", i64::MAX)).contains("lookback_hours"));
}

#[test]
fn test_bounds_accept_their_limits() {
    let config = FileConfig::parse(
        "[pipeline]\nretry_base_delay_ms = 60000\nrun_deadline_secs = 604800\n[catalog]\nlookback_hours = 744",
    )
    .unwrap()
    .into_app_config()
    .unwrap();
    assert_eq!(config.pipeline.run_deadline, Duration::from_secs(604800));
    assert_eq!(config.pipeline.retry.max_delay, Duration::from_secs(60 * 32));
    assert_eq!(config.catalog.lookback_hours, 744);

    let policy = paper_pipeline::RetryPolicy::new(3, Duration::MAX);
    assert_eq!(policy.max_delay, Duration::MAX);
}

#[test]
fn test_default_categories_leave_out_neural_computing() {
    let config = FileConfig::parse("").unwrap().into_app_config().unwrap();
    assert_eq!(config.catalog.categories.len(), 7);
    assert!(!config.catalog.categories.contains(&Category::CsNe));
    assert_eq!(config.catalog.lookback_hours, 48);
}
