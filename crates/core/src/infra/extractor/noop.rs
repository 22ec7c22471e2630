use async_trait::async_trait;
use serde_json::json;

use super::{ExtractionError, Extractor};
use crate::domain::job::ProcessingConfig;

/// NoopExtractor: 空の抽出結果を返す開発用実装。
/// API キー未設定時のフォールバックにも使う。
pub struct NoopExtractor;

#[async_trait]
impl Extractor for NoopExtractor {
    async fn extract(
        &self,
        transcript: &str,
        _user_query: Option<&str>,
        _config: &ProcessingConfig,
    ) -> Result<serde_json::Value, ExtractionError> {
        let english = format!(
            "Transcript captured ({} characters).",
            transcript.chars().count()
        );
        Ok(json!({
            "key_takeaways": {"english": english},
            "dated_events": [],
            "notes": [],
            "user_requested_data": {"type": null, "content": null}
        }))
    }

    fn name(&self) -> &str {
        "noop"
    }
}
