use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::error::AppError;
use crate::domain::settings::{CalendarChoice, ExtractorChoice, PipelineSettings, TranscriberChoice};
use crate::domain::transcript::Transcriber;
use crate::infra::audio::PassthroughEnhancer;
use crate::infra::calendar::google::GoogleCalendarProvider;
use crate::infra::calendar::{CalendarProvider, NoopCalendarProvider};
use crate::infra::extractor::claude::ClaudeExtractor;
use crate::infra::extractor::{Extractor, NoopExtractor};
use crate::infra::storage::Storage;
use crate::infra::stt::{NoopTranscriber, WhisperConfig, WhisperSidecar};
use crate::usecase::meeting_service::MeetingService;
use crate::usecase::orchestrator::Collaborators;

/// DB パス: `MTG_DB_PATH` があればそれを使い、なければアプリデータディレクトリ
pub fn default_db_path() -> PathBuf {
    match std::env::var("MTG_DB_PATH") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meetingPipeline")
            .join("meetings.db"),
    }
}

/// ストレージを開く（親ディレクトリがなければ作成）
pub fn open_storage(path: &std::path::Path) -> Result<Storage, AppError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| {
            AppError::storage(format!("データディレクトリ作成失敗 {dir:?}: {e}"))
        })?;
    }
    Storage::open(&path.to_string_lossy())
}

/// 文字起こしエンジンを構築する（whisper が使えなければ Noop）
fn create_transcriber(settings: &PipelineSettings) -> Arc<dyn Transcriber> {
    if settings.transcriber == TranscriberChoice::Whisper {
        let sidecar = WhisperSidecar::new(WhisperConfig {
            binary_path: settings.whisper_binary.clone(),
            model_path: settings.whisper_model.clone(),
            language: settings.language.clone(),
            ..Default::default()
        });
        match sidecar.validate() {
            Ok(()) => {
                log::info!("whisper.cpp transcriber selected");
                return Arc::new(sidecar);
            }
            Err(e) => log::warn!("whisper.cpp not available, falling back to Noop: {e}"),
        }
    }

    log::info!("Using Noop transcriber");
    Arc::new(NoopTranscriber)
}

/// 抽出器を構築する（API キーがなければ Noop）
fn create_extractor(settings: &PipelineSettings) -> Arc<dyn Extractor> {
    if settings.extractor == ExtractorChoice::Claude {
        match settings.claude_api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                match ClaudeExtractor::new(key.to_string(), settings.claude_model.clone()) {
                    Ok(extractor) => {
                        log::info!("Claude extractor selected ({})", settings.claude_model);
                        return Arc::new(extractor);
                    }
                    Err(e) => log::warn!("Claude extractor unavailable, falling back to Noop: {e}"),
                }
            }
            None => log::warn!("Claude API key not set, falling back to Noop extractor"),
        }
    }

    log::info!("Using Noop extractor");
    Arc::new(NoopExtractor)
}

fn create_calendar_provider(settings: &PipelineSettings) -> Arc<dyn CalendarProvider> {
    if settings.calendar_provider == CalendarChoice::Google {
        match GoogleCalendarProvider::new(
            settings.google_client_id.clone(),
            settings.google_client_secret.clone(),
        ) {
            Ok(provider) => {
                log::info!("Google Calendar provider selected");
                return Arc::new(provider);
            }
            Err(e) => log::warn!("Google Calendar unavailable, falling back to Noop: {e}"),
        }
    }

    log::info!("Using Noop calendar provider");
    Arc::new(NoopCalendarProvider)
}

/// 保存済み設定からコラボレータを選び、サービスを組み立てる。
pub fn build_service(storage: Storage) -> Result<MeetingService, AppError> {
    let settings = storage.get_settings()?;
    let collaborators = Collaborators {
        transcriber: create_transcriber(&settings),
        extractor: create_extractor(&settings),
        enhancer: Arc::new(PassthroughEnhancer),
    };
    let calendar = create_calendar_provider(&settings);
    Ok(MeetingService::new(Arc::new(storage), collaborators, calendar))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_engines_fall_back_to_noop() {
        let settings = PipelineSettings {
            whisper_binary: PathBuf::from("/nonexistent/whisper-cli-xyz"),
            claude_api_key: None,
            ..Default::default()
        };
        assert_eq!(create_transcriber(&settings).name(), "noop");
        assert_eq!(create_extractor(&settings).name(), "noop");
    }

    #[test]
    fn noop_choices_are_respected() {
        let settings = PipelineSettings {
            extractor: ExtractorChoice::Noop,
            calendar_provider: CalendarChoice::Noop,
            claude_api_key: Some("sk-test".into()),
            ..Default::default()
        };
        assert_eq!(create_extractor(&settings).name(), "noop");
        assert_eq!(create_calendar_provider(&settings).name(), "noop");
    }

    #[test]
    fn open_storage_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("meetings.db");
        let storage = open_storage(&path).unwrap();
        assert!(path.exists());
        build_service(storage).unwrap();
    }
}
