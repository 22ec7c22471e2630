use async_trait::async_trait;

use crate::domain::transcript::AudioRef;

#[derive(Debug, thiserror::Error)]
pub enum EnhanceError {
    #[error("Enhancer not available: {0}")]
    NotAvailable(String),
    #[error("Enhancement failed: {0}")]
    Failed(String),
}

/// 音声エンハンス（ノイズ除去など）のコアトレイト。
/// 出力は別ファイルでもよく、失敗時は呼び出し側が元の入力を使う。
#[async_trait]
pub trait AudioEnhancer: Send + Sync {
    async fn enhance(&self, audio: &AudioRef) -> Result<AudioRef, EnhanceError>;

    fn name(&self) -> &str;
}

/// 入力をそのまま返すエンハンサ。
pub struct PassthroughEnhancer;

#[async_trait]
impl AudioEnhancer for PassthroughEnhancer {
    async fn enhance(&self, audio: &AudioRef) -> Result<AudioRef, EnhanceError> {
        Ok(audio.clone())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}
