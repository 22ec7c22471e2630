use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// パイプライン設定（SQLite の settings テーブルに key/value で保存）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// 文字起こしエンジン選択
    pub transcriber: TranscriberChoice,
    /// 抽出エンジン選択
    pub extractor: ExtractorChoice,
    /// カレンダー連携先
    pub calendar_provider: CalendarChoice,
    /// Claude API キー（ローカル SQLite に保存）
    pub claude_api_key: Option<String>,
    /// 抽出に使うモデル
    pub claude_model: String,
    /// whisper-cli バイナリのパス
    pub whisper_binary: PathBuf,
    /// GGML モデルファイルのパス
    pub whisper_model: PathBuf,
    /// 文字起こし言語（"auto" で自動判定）
    pub language: String,
    /// Google OAuth クライアント（トークン更新用）
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    /// 処理後もアップロードファイルを残すか
    pub retain_uploads: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriberChoice {
    Whisper,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorChoice {
    Claude,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarChoice {
    Google,
    Noop,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            transcriber: TranscriberChoice::Whisper,
            extractor: ExtractorChoice::Claude,
            calendar_provider: CalendarChoice::Google,
            claude_api_key: None,
            claude_model: "claude-sonnet-4-20250514".to_string(),
            whisper_binary: PathBuf::from("whisper-cli"),
            whisper_model: PathBuf::from("models/ggml-base.bin"),
            language: "auto".to_string(),
            google_client_id: None,
            google_client_secret: None,
            retain_uploads: false,
        }
    }
}
