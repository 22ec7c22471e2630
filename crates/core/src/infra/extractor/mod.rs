pub mod claude;
mod noop;
pub mod prompts;

pub use noop::NoopExtractor;

use async_trait::async_trait;

use crate::domain::job::ProcessingConfig;

/// 抽出エラー
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extractor not available: {0}")]
    NotAvailable(String),
    #[error("Extraction failed: {0}")]
    Failed(String),
    #[error("Extractor returned malformed JSON: {0}")]
    MalformedResponse(String),
    #[error("Extraction timeout")]
    Timeout,
}

/// 構造化抽出器 trait（LLM 実装を設定で差し替える）
///
/// 戻り値は信頼できない JSON。呼び出し側で `ExtractionValidator` に通す。
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        transcript: &str,
        user_query: Option<&str>,
        config: &ProcessingConfig,
    ) -> Result<serde_json::Value, ExtractionError>;

    fn name(&self) -> &str;
}
