use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::domain::transcript::{AudioRef, Transcriber, TranscriptionError, Utterance};

/// Whisper.cpp sidecar の設定。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WhisperConfig {
    /// whisper-cli バイナリのパス
    pub binary_path: PathBuf,
    /// GGML モデルファイルのパス
    pub model_path: PathBuf,
    /// デフォルト言語 (例: "en", "ar", "auto")
    pub language: String,
    /// ビームサーチサイズ (1 = greedy)
    pub beam_size: u32,
    /// タイムアウト秒数（会議録音は長いので分単位）
    pub timeout_secs: u64,
    pub threads: u32,
    /// ステレオ録音のチャンネル差で話者を分離する (`--diarize`)
    pub diarize: bool,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("whisper-cli"),
            model_path: PathBuf::from("models/ggml-base.bin"),
            language: "auto".into(),
            beam_size: 5,
            timeout_secs: 1800,
            threads: 4,
            diarize: true,
        }
    }
}

/// Whisper.cpp sidecar プロセスマネージャ。
pub struct WhisperSidecar {
    config: parking_lot::RwLock<WhisperConfig>,
}

impl WhisperSidecar {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
        }
    }

    /// 設定を動的に更新する（モデル切替など）。
    pub fn update_config(&self, config: WhisperConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> WhisperConfig {
        self.config.read().clone()
    }

    /// whisper バイナリとモデルの存在を検証する。
    pub fn validate(&self) -> Result<(), TranscriptionError> {
        let config = self.config.read();
        if !config.binary_path.exists() && which_binary(&config.binary_path).is_none() {
            return Err(TranscriptionError::engine_not_available(format!(
                "Whisper binary not found: {:?}",
                config.binary_path
            )));
        }
        if !config.model_path.exists() {
            return Err(TranscriptionError::engine_not_available(format!(
                "Whisper model not found: {:?}",
                config.model_path
            )));
        }
        Ok(())
    }

    fn build_args(config: &WhisperConfig, audio_path: &Path, language: &str) -> Vec<String> {
        let mut args = vec![
            "--model".into(),
            config.model_path.to_string_lossy().into(),
            "--language".into(),
            language.into(),
            "--output-json".into(),
            "--no-prints".into(),
            "--threads".into(),
            config.threads.to_string(),
            "--beam-size".into(),
            config.beam_size.to_string(),
        ];

        if config.diarize {
            args.push("--diarize".into());
        }

        args.push("--file".into());
        args.push(audio_path.to_string_lossy().into());
        args
    }

    async fn run_whisper(
        &self,
        audio_path: &Path,
        language: &str,
    ) -> Result<Vec<WhisperSegment>, TranscriptionError> {
        // ロック保持を最小化
        let config = self.config.read().clone();
        let args = Self::build_args(&config, audio_path, language);

        log::debug!("Running whisper: {:?} {:?}", config.binary_path, args);

        let child = Command::new(&config.binary_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TranscriptionError::engine_not_available(format!(
                        "Whisper binary not found: {:?}",
                        config.binary_path
                    ))
                } else {
                    TranscriptionError::transcription_failed(format!(
                        "Failed to spawn whisper process: {e}"
                    ))
                }
            })?;

        let output = timeout(
            Duration::from_secs(config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            TranscriptionError::timeout(format!("Whisper timed out after {}s", config.timeout_secs))
        })?
        .map_err(|e| {
            TranscriptionError::transcription_failed(format!("Whisper process error: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscriptionError::transcription_failed(format!(
                "Whisper exited with status {}: {}",
                output.status, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_whisper_output(&stdout)
    }
}

// ─── Whisper JSON デシリアライゼーション ──────────────────────────

#[derive(Debug, serde::Deserialize)]
struct WhisperJsonOutput {
    transcription: Vec<WhisperJsonSegment>,
}

#[derive(Debug, serde::Deserialize)]
struct WhisperJsonSegment {
    offsets: WhisperOffsets,
    text: String,
    /// `--diarize` 指定時のみ出力される
    #[serde(default)]
    speaker: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}

#[derive(Debug, PartialEq)]
struct WhisperSegment {
    text: String,
    speaker: String,
    start_ms: u64,
    end_ms: u64,
}

impl WhisperSegment {
    fn into_utterance(self) -> Utterance {
        Utterance {
            speaker: self.speaker,
            text: self.text,
            start: self.start_ms as f64 / 1000.0,
            end: self.end_ms as f64 / 1000.0,
        }
    }
}

/// whisper JSON 出力をパースする。空テキストのセグメントは捨てる。
fn parse_whisper_output(output: &str) -> Result<Vec<WhisperSegment>, TranscriptionError> {
    let json_str = output.trim();
    if json_str.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: WhisperJsonOutput = serde_json::from_str(json_str).map_err(|e| {
        let raw: String = json_str.chars().take(500).collect();
        TranscriptionError::transcription_failed(format!(
            "Failed to parse whisper JSON: {e}. Raw: {raw}"
        ))
    })?;

    Ok(parsed
        .transcription
        .into_iter()
        .filter(|seg| !seg.text.trim().is_empty())
        .map(|seg| WhisperSegment {
            text: seg.text.trim().to_string(),
            speaker: seg
                .speaker
                .map(|s| s.trim().trim_start_matches('(').trim_end_matches(')').to_string())
                .unwrap_or_default(),
            start_ms: seg.offsets.from,
            end_ms: seg.offsets.to,
        })
        .collect())
}

/// PATH 上でバイナリを検索する簡易ヘルパー。
fn which_binary(name: &Path) -> Option<PathBuf> {
    let name_str = name.to_string_lossy();
    if name_str.contains('/') || name_str.contains('\\') {
        return if name.exists() { Some(name.to_path_buf()) } else { None };
    }
    let path_var = std::env::var("PATH").ok()?;
    path_var
        .split(':')
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|full| full.exists())
}

// ─── Transcriber 実装 ────────────────────────────────────────────

#[async_trait::async_trait]
impl Transcriber for WhisperSidecar {
    async fn transcribe(&self, audio: &AudioRef) -> Result<Vec<Utterance>, TranscriptionError> {
        if !audio.path.exists() {
            return Err(TranscriptionError::audio_format(format!(
                "Audio file does not exist: {:?}",
                audio.path
            )));
        }

        // 言語解決: AudioRef > config default
        let language = match audio.language.as_deref().filter(|l| !l.is_empty()) {
            Some(lang) => lang.to_string(),
            None => self.config.read().language.clone(),
        };

        let segments = self.run_whisper(&audio.path, &language).await?;
        if segments.is_empty() {
            return Err(TranscriptionError::no_speech());
        }

        log::info!("whisper: {} セグメントを文字起こししました", segments.len());
        Ok(segments.into_iter().map(WhisperSegment::into_utterance).collect())
    }

    fn name(&self) -> &str {
        "whisper.cpp"
    }
}

// ─── テスト ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transcript::TranscriptionErrorKind;

    #[test]
    fn parse_valid_json() {
        let json = r#"{
            "transcription": [
                {
                    "timestamps": { "from": "00:00:00,000", "to": "00:00:02,500" },
                    "offsets": { "from": 0, "to": 2500 },
                    "text": " Good morning everyone.",
                    "speaker": "(speaker 0)"
                },
                {
                    "timestamps": { "from": "00:00:02,500", "to": "00:00:05,000" },
                    "offsets": { "from": 2500, "to": 5000 },
                    "text": " Let's start with the budget."
                }
            ]
        }"#;

        let segments = parse_whisper_output(json).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Good morning everyone.");
        assert_eq!(segments[0].speaker, "speaker 0");
        assert_eq!(segments[0].end_ms, 2500);
        assert_eq!(segments[1].speaker, "");
    }

    #[test]
    fn segment_offsets_become_seconds() {
        let seg = WhisperSegment {
            text: "hi".into(),
            speaker: String::new(),
            start_ms: 1500,
            end_ms: 4250,
        };
        let u = seg.into_utterance();
        assert_eq!(u.start, 1.5);
        assert_eq!(u.end, 4.25);
    }

    #[test]
    fn blank_segments_are_dropped() {
        let json = r#"{"transcription": [{"offsets": {"from": 0, "to": 10}, "text": "   "}]}"#;
        assert!(parse_whisper_output(json).unwrap().is_empty());
    }

    #[test]
    fn parse_empty_string() {
        assert!(parse_whisper_output("   \n  ").unwrap().is_empty());
    }

    #[test]
    fn parse_invalid_json() {
        let err = parse_whisper_output("{invalid json}").unwrap_err();
        assert_eq!(err.kind, TranscriptionErrorKind::TranscriptionFailed);
    }

    #[test]
    fn validate_missing_binary() {
        let config = WhisperConfig {
            binary_path: PathBuf::from("/nonexistent/whisper-cli-xyz"),
            model_path: PathBuf::from("/nonexistent/model.bin"),
            ..Default::default()
        };
        let err = WhisperSidecar::new(config).validate().unwrap_err();
        assert_eq!(err.kind, TranscriptionErrorKind::EngineNotAvailable);
        assert!(!err.recoverable);
    }

    #[tokio::test]
    async fn missing_audio_file_is_format_error() {
        let engine = WhisperSidecar::new(WhisperConfig::default());
        let err = engine
            .transcribe(&AudioRef::new("/nonexistent/meeting.wav"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TranscriptionErrorKind::AudioFormat);
    }

    #[test]
    fn build_args_format() {
        let args = WhisperSidecar::build_args(
            &WhisperConfig::default(),
            Path::new("/tmp/meeting.wav"),
            "auto",
        );
        assert!(args.contains(&"--output-json".to_string()));
        assert!(args.contains(&"--diarize".to_string()));
        assert!(args.contains(&"auto".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/meeting.wav"));
    }

    #[test]
    fn build_args_without_diarize() {
        let config = WhisperConfig {
            diarize: false,
            ..Default::default()
        };
        let args = WhisperSidecar::build_args(&config, Path::new("/tmp/a.wav"), "en");
        assert!(!args.contains(&"--diarize".to_string()));
    }

    #[test]
    fn update_config_swaps_model() {
        let engine = WhisperSidecar::new(WhisperConfig::default());
        engine.update_config(WhisperConfig {
            model_path: PathBuf::from("models/ggml-large-v3.bin"),
            ..Default::default()
        });
        assert_eq!(
            engine.config().model_path,
            PathBuf::from("models/ggml-large-v3.bin")
        );
        assert_eq!(engine.name(), "whisper.cpp");
    }
}
