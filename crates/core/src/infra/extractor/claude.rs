use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::prompts;
use super::{ExtractionError, Extractor};
use crate::domain::job::ProcessingConfig;

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Claude API を使用した抽出器
pub struct ClaudeExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

impl ClaudeExtractor {
    pub fn new(api_key: String, model: String) -> Result<Self, ExtractionError> {
        // 長い会議の抽出は時間がかかる
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ExtractionError::NotAvailable(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl Extractor for ClaudeExtractor {
    async fn extract(
        &self,
        transcript: &str,
        user_query: Option<&str>,
        config: &ProcessingConfig,
    ) -> Result<serde_json::Value, ExtractionError> {
        let today = chrono::Local::now().date_naive();
        let user_msg = prompts::build_prompt(transcript, user_query, config, today);

        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: 8192,
            temperature: 0.1,
            system: prompts::SYSTEM_EXTRACTION.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: user_msg,
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractionError::Timeout
                } else {
                    ExtractionError::Failed(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Failed(format!(
                "Claude API error: {status} - {body}"
            )));
        }

        let msg_response: MessageResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Failed(format!("Response parse error: {e}")))?;

        let text = msg_response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ExtractionError::Failed("Empty response from Claude API".to_string()));
        }

        let value = parse_json_reply(&text)?;
        log::info!(
            "抽出完了: dated_events={}, notes={}",
            value["dated_events"].as_array().map_or(0, |a| a.len()),
            value["notes"].as_array().map_or(0, |a| a.len()),
        );
        Ok(value)
    }

    fn name(&self) -> &str {
        "claude"
    }
}

/// モデル応答から JSON オブジェクトを取り出す（```json フェンスや前置きを許容）
fn parse_json_reply(text: &str) -> Result<serde_json::Value, ExtractionError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(ExtractionError::MalformedResponse(format!(
                "no JSON object in reply: {}",
                truncate(text, 200)
            )))
        }
    };

    serde_json::from_str(body).map_err(|e| {
        ExtractionError::MalformedResponse(format!("{e}. Raw: {}", truncate(body, 500)))
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_extractor_name() {
        let extractor = ClaudeExtractor::new("test-key".into(), "claude-test".into()).unwrap();
        assert_eq!(extractor.name(), "claude");
    }

    #[test]
    fn test_parse_plain_json() {
        let v = parse_json_reply(r#"{"dated_events": [], "notes": []}"#).unwrap();
        assert!(v["dated_events"].is_array());
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = "Here you go:\n```json\n{\"key_takeaways\": {\"english\": \"• ok\"}}\n```";
        let v = parse_json_reply(reply).unwrap();
        assert_eq!(v["key_takeaways"]["english"], "• ok");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_json_reply("I could not find anything.").unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedResponse(_)));

        let err = parse_json_reply("{not: json}").unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedResponse(_)));
    }
}
