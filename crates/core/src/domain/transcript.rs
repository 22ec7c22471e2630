use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── AudioRef ────────────────────────────────────────────────────

/// アップロードされた音声ファイルへの参照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRef {
    /// ディスク上のファイルパス
    pub path: PathBuf,
    /// アップロード時のファイル名
    pub file_name: Option<String>,
    /// 言語ヒント (例: "en", "ar")
    pub language: Option<String>,
}

impl AudioRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_name: None,
            language: None,
        }
    }

    /// 同じメタデータで別ファイルを指す参照を作る（エンハンス後の出力等）。
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }
}

// ─── Utterance ───────────────────────────────────────────────────

/// 話者付き発話。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// 話者ラベル。ダイアライズ前は空のことがある。
    pub speaker: String,
    pub text: String,
    /// 開始秒
    pub start: f64,
    /// 終了秒
    pub end: f64,
}

impl Utterance {
    /// `[mm:ss - mm:ss] Speaker: text` 形式の1行
    pub fn to_line(&self) -> String {
        format!(
            "[{} - {}] {}: {}",
            format_timestamp(self.start),
            format_timestamp(self.end),
            self.speaker,
            self.text
        )
    }
}

fn format_timestamp(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// 話者ラベルを正規化する。
///
/// - 空ラベル → "Speaker 1"
/// - "A" や "2" のような裸のラベル → "Speaker A" / "Speaker 2"
/// - それ以外はそのまま
pub fn label_speakers(utterances: &mut [Utterance]) {
    for u in utterances.iter_mut() {
        let label = u.speaker.trim();
        u.speaker = if label.is_empty() {
            "Speaker 1".to_string()
        } else if label.to_lowercase().starts_with("speaker") {
            label.to_string()
        } else if label.chars().count() <= 2 {
            format!("Speaker {label}")
        } else {
            label.to_string()
        };
    }
}

/// ダイアライズ済みのトランスクリプト本文
pub fn render_transcript(utterances: &[Utterance]) -> String {
    utterances
        .iter()
        .map(Utterance::to_line)
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── TranscriptionError ──────────────────────────────────────────

/// 文字起こしで発生するエラー。
#[derive(Debug, Clone)]
pub struct TranscriptionError {
    pub kind: TranscriptionErrorKind,
    pub detail: String,
    pub recoverable: bool,
}

impl std::fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TranscriptionError::{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for TranscriptionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscriptionErrorKind {
    /// 音声フォーマットが不正/非対応、ファイルが存在しない
    AudioFormat,
    /// エンジンが利用不可 (未インストール、モデル未検出等)
    EngineNotAvailable,
    /// 文字起こし処理中のエラー
    TranscriptionFailed,
    Timeout,
    /// 発話が検出されなかった
    NoSpeech,
}

impl TranscriptionError {
    pub fn audio_format(detail: impl Into<String>) -> Self {
        Self { kind: TranscriptionErrorKind::AudioFormat, detail: detail.into(), recoverable: false }
    }

    pub fn engine_not_available(detail: impl Into<String>) -> Self {
        Self { kind: TranscriptionErrorKind::EngineNotAvailable, detail: detail.into(), recoverable: false }
    }

    pub fn transcription_failed(detail: impl Into<String>) -> Self {
        Self { kind: TranscriptionErrorKind::TranscriptionFailed, detail: detail.into(), recoverable: true }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self { kind: TranscriptionErrorKind::Timeout, detail: detail.into(), recoverable: true }
    }

    pub fn no_speech() -> Self {
        Self { kind: TranscriptionErrorKind::NoSpeech, detail: "No speech detected".into(), recoverable: false }
    }
}

// ─── Transcriber trait ───────────────────────────────────────────

/// 文字起こし＋話者分離エンジンのコアトレイト。
///
/// `dyn Transcriber` として設定から差し替え可能にする。
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    /// 音声ファイルを話者付き発話列に変換する。発話がなければ `NoSpeech`。
    async fn transcribe(&self, audio: &AudioRef) -> Result<Vec<Utterance>, TranscriptionError>;

    /// エンジン名 (例: "whisper.cpp")
    fn name(&self) -> &str;
}

// ─── Tests ───────────────────────────────────────────────────────
