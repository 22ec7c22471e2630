use async_trait::async_trait;

use crate::domain::transcript::{AudioRef, Transcriber, TranscriptionError, Utterance};

/// NoopTranscriber: 固定の発話を返すモック実装。
/// whisper が未導入の環境やテストで使う。
pub struct NoopTranscriber;

#[async_trait]
impl Transcriber for NoopTranscriber {
    async fn transcribe(&self, audio: &AudioRef) -> Result<Vec<Utterance>, TranscriptionError> {
        let name = audio
            .file_name
            .clone()
            .unwrap_or_else(|| audio.path.to_string_lossy().into_owned());
        Ok(vec![Utterance {
            speaker: "A".to_string(),
            text: format!("[STTスタブ] {name} のモック書き起こし結果です"),
            start: 0.0,
            end: 1.0,
        }])
    }

    fn name(&self) -> &str {
        "noop"
    }
}
