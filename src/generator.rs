use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::model::{Candidate, Category};
use crate::regions::Region;
use crate::throttle::RateLimiter;

const REQUEST_TIMEOUT_SECS: u64 = 90;
const GENERATOR_QPS: u32 = 1;
const TEMPERATURE: f32 = 0.7;
const MAX_AVOID_NAMES: usize = 60;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerateError {
    #[error("generator is rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("generation failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for GenerateError {
    fn from(err: reqwest::Error) -> Self {
        GenerateError::Failed(err.to_string())
    }
}

#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    /// Up to `count` candidates for one region and category. `avoid` lists
    /// names already produced for the same job.
    async fn generate(
        &self,
        region: &Region,
        category: Category,
        count: usize,
        avoid: &[String],
    ) -> Result<Vec<Candidate>, GenerateError>;
}

pub struct HttpCandidateGenerator {
    http: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    model: String,
    local_language: String,
    rate_limiter: RateLimiter,
}

impl HttpCandidateGenerator {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.require_generator_key()?.clone();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            api_key,
            api_base: config.generator_api_base.trim_end_matches('/').to_string(),
            model: config.generator_model.clone(),
            local_language: config.local_language.clone(),
            rate_limiter: RateLimiter::new(GENERATOR_QPS),
        })
    }

    fn prompt(
        &self,
        region: &Region,
        category: Category,
        count: usize,
        avoid: &[String],
    ) -> String {
        let mut prompt = format!(
            "List {count} real, currently operating {hint} in {native} ({label}), Japan.\n\
             Respond with a JSON object {{\"places\": [...]}} where each entry has \
             \"nameLocal\" (the name as written for {language} readers), \
             \"nameNative\" (the official name exactly as shown on signage or maps), \
             \"description\" (one sentence in {language}) and \
             \"tags\" (up to three short keywords).\n\
             Only include places you are certain exist. Do not invent names.",
            hint = category.generation_hint(),
            native = region.native_label,
            label = region.label,
            language = self.local_language,
        );
        if !avoid.is_empty() {
            let skipped: Vec<&str> = avoid
                .iter()
                .take(MAX_AVOID_NAMES)
                .map(String::as_str)
                .collect();
            prompt.push_str("\nDo not repeat any of these: ");
            prompt.push_str(&skipped.join(", "));
        }
        prompt
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct GeneratedList {
    #[serde(default)]
    places: Vec<GeneratedPlace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedPlace {
    name_local: Option<String>,
    name_native: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[async_trait]
impl CandidateGenerator for HttpCandidateGenerator {
    async fn generate(
        &self,
        region: &Region,
        category: Category,
        count: usize,
        avoid: &[String],
    ) -> Result<Vec<Candidate>, GenerateError> {
        let prompt = self.prompt(region, category, count, avoid);
        let body = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You are a travel researcher who only names venues \
                              that verifiably exist.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };

        self.rate_limiter.wait().await;
        debug!(region = %region.key, %category, count, "requesting candidates");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = retry_after_hint(response.headers());
            warn!(region = %region.key, ?retry_after, "generator rate limited");
            return Err(GenerateError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerateError::Failed(format!("status {}: {text}", status.as_u16())));
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerateError::Failed("empty completion".into()))?;
        parse_candidates(&content, region, category)
    }
}

/// Validates a completion payload into candidates for one job.
pub fn parse_candidates(
    content: &str,
    region: &Region,
    category: Category,
) -> Result<Vec<Candidate>, GenerateError> {
    let list: GeneratedList = serde_json::from_str(strip_code_fence(content))
        .map_err(|err| GenerateError::Failed(format!("malformed completion: {err}")))?;
    Ok(list
        .places
        .into_iter()
        .filter_map(|place| {
            let name_native = place
                .name_native
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty());
            let name_local = place
                .name_local
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .or_else(|| name_native.clone())?;
            Some(Candidate {
                name_local,
                name_native,
                category,
                description: place
                    .description
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty()),
                tags: place
                    .tags
                    .into_iter()
                    .map(|tag| tag.trim().to_string())
                    .filter(|tag| !tag.is_empty())
                    .collect(),
                region: region.key.to_string(),
            })
        })
        .collect())
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0)
    };
    header("retry-after-ms")
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
        .or_else(|| {
            header("retry-after").and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        })
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::regions;

    #[test]
    fn parses_and_validates_completion() {
        let region = regions::require("fukuoka").unwrap();
        let content = r#"```json
        {"places": [
            {"nameLocal": "이치란 본점", "nameNative": "一蘭 本社総本店", "tags": ["라멘", " "]},
            {"nameLocal": "  ", "nameNative": "  "},
            {"nameNative": "元祖長浜屋", "description": "  "}
        ]}
        ```"#;

        let candidates = parse_candidates(content, region, Category::Restaurant).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].tags, vec!["라멘"]);
        assert_eq!(candidates[0].region, "fukuoka");
        assert_eq!(candidates[1].name_local, "元祖長浜屋");
        assert!(candidates[1].description.is_none());
        assert!(candidates.iter().all(|c| c.category == Category::Restaurant));
    }

    #[test]
    fn malformed_completion_is_a_failure() {
        let region = regions::require("fukuoka").unwrap();
        assert!(matches!(
            parse_candidates("not json", region, Category::Cafe),
            Err(GenerateError::Failed(_))
        ));
    }

    #[test]
    fn reads_retry_hints() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_hint(&headers), None);

        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(7)));

        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn oversized_retry_hint_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1e20"));
        assert_eq!(retry_after_hint(&headers), None);

        headers.insert("retry-after-ms", HeaderValue::from_static("1e30"));
        assert_eq!(retry_after_hint(&headers), None);

        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn prompt_lists_names_to_avoid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::test_config(dir.path());
        config.generator_api_key = Some(SecretString::new("gen".into()));
        let generator = HttpCandidateGenerator::new(&config).unwrap();
        let region = regions::require("yufuin").unwrap();

        let prompt = generator.prompt(region, Category::Cafe, 10, &["B-speak".into()]);
        assert!(prompt.contains("由布院"));
        assert!(prompt.contains("cafes"));
        assert!(prompt.contains("B-speak"));
    }
}
