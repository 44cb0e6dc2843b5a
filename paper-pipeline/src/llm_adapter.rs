use crate::config::{AxisWeights, OracleConfig, SCREENING_AXIS, SCREENING_MAX, SCREENING_MIN};
use crate::types::{OracleError, OracleRequest, OracleResponse, PipelineError, Result, RubricId, ScoringOracle};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Fields a model may add on its own that must never feed the score.
const IGNORED_FIELDS: [&str; 3] = ["total_score", "verdict", "tier"];

/// Scores items with a Gemini model through the `generateContent` REST API.
pub struct GeminiOracle {
    client: Client,
    config: OracleConfig,
    api_key: String,
    weights: AxisWeights,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GeminiOracle {
    pub fn new(config: OracleConfig, api_key: String, weights: AxisWeights) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::Config(format!("{} is empty", config.api_key_env)));
        }
        let client = Client::builder().gzip(true).build()?;
        Ok(Self {
            client,
            config,
            api_key,
            weights,
        })
    }

    /// Read the API key from the environment variable named in the config.
    pub fn from_env(config: OracleConfig, weights: AxisWeights) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| PipelineError::Config(format!("{} is not set", config.api_key_env)))?;
        Self::new(config, api_key, weights)
    }

    pub fn prompt(&self, request: &OracleRequest) -> String {
        let abstract_text = truncate_chars(&request.payload.abstract_text, self.config.abstract_char_limit);
        match request.rubric {
            RubricId::ResearchUsefulness => research_usefulness_prompt(&request.payload.title, abstract_text),
            RubricId::ShortsVirality => shorts_virality_prompt(&request.payload.title, abstract_text, &self.weights),
        }
    }

    async fn generate(&self, prompt: String) -> std::result::Result<String, OracleError> {
        let url = format!("{}/models/{}:generateContent", self.config.endpoint.trim_end_matches('/'), self.config.model);
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                response_mime_type: "application/json",
            },
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(OracleError::RateLimited { retry_after_ms });
        }
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::Rejected(format!("HTTP {}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(OracleError::Transport(format!("HTTP {}", status)));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("unreadable response body: {}", e)))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(OracleError::Malformed("empty candidate text".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl ScoringOracle for GeminiOracle {
    fn oracle_name(&self) -> String {
        format!("gemini:{}", self.config.model)
    }

    async fn score(&self, request: &OracleRequest) -> std::result::Result<OracleResponse, OracleError> {
        let raw_text = self.generate(self.prompt(request)).await?;
        let axis_scores = extract_axis_scores(&raw_text)?;
        debug!(item_id = %request.item_id, rubric = request.rubric.as_str(), axes = axis_scores.len(), "Model responded");
        Ok(OracleResponse {
            request_id: request.request_id,
            item_id: request.item_id.clone(),
            axis_scores,
            raw_text,
        })
    }
}

/// Pull the axis map out of free-form model text: the span from the first
/// `{` to the last `}` must parse as a JSON object. `{"score": n}` objects are
/// flattened to `n`; any total or verdict the model volunteers is dropped.
pub fn extract_axis_scores(raw_text: &str) -> std::result::Result<BTreeMap<String, serde_json::Value>, OracleError> {
    let (start, end) = match (raw_text.find('{'), raw_text.rfind('}')) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => return Err(OracleError::Malformed("no JSON object in model output".to_string())),
    };

    let value: serde_json::Value = serde_json::from_str(&raw_text[start..=end])
        .map_err(|e| OracleError::Malformed(format!("invalid JSON in model output: {}", e)))?;
    let serde_json::Value::Object(fields) = value else {
        return Err(OracleError::Malformed("model output is not a JSON object".to_string()));
    };

    let mut scores = BTreeMap::new();
    for (name, value) in fields {
        if IGNORED_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let value = match value {
            serde_json::Value::Object(mut nested) => match nested.remove("score") {
                Some(score) => score,
                None => continue,
            },
            serde_json::Value::Array(_) => continue,
            other => other,
        };
        scores.insert(name, value);
    }
    Ok(scores)
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn research_usefulness_prompt(title: &str, abstract_text: &str) -> String {
    format!(
        r#"You are an expert reviewer of academic papers.
Rate how useful the following paper is, as a single integer from {min} to {max}.
Consider practical applicability, novelty, likely impact on the field, and how
easily it can be explained to a general audience in a short video.

Title: {title}
Abstract: {abstract_text}

Respond with JSON only:
{{"{axis}": <integer {min}-{max}>, "reason": "<one sentence>"}}"#,
        min = SCREENING_MIN,
        max = SCREENING_MAX,
        axis = SCREENING_AXIS,
    )
}

fn shorts_virality_prompt(title: &str, abstract_text: &str, weights: &AxisWeights) -> String {
    let mut criteria = String::new();
    let mut shape = Vec::new();
    for (axis, max) in weights.iter() {
        criteria.push_str(&format!("- {} (0-{}): {}\n", axis, max, axis_guidance(axis)));
        shape.push(format!("\"{}\": {{\"score\": <0-{}>, \"reason\": \"...\"}}", axis, max));
    }
    format!(
        r#"You are an editor for 30-second vertical videos.
Judge how likely the following paper is to do well as a short video. Score each
criterion independently within its range.

{criteria}
Title: {title}
Abstract: {abstract_text}

Respond with JSON only:
{{{shape}, "one_line_hook": "<hook, 15 words or fewer>"}}"#,
        shape = shape.join(", "),
    )
}

fn axis_guidance(axis: &str) -> &'static str {
    match axis {
        "clickbait_potential" => "can an honest but striking headline be written about it",
        "life_impact" => "would it change everyday work or life if widely adopted",
        "human_comparison" => "does it compare against or beat humans or experts",
        "strong_numbers" => "does it report striking numbers such as large accuracy or speed gains",
        "use_case" => "is there a concrete, familiar application domain",
        "implementation" => "can people use it now rather than in the distant future",
        _ => "overall appeal",
    }
}
