use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::domain::error::{AppError, ErrorCode};
use crate::domain::extraction::{ExtractionResult, FinalSummary, NoteCategory};
use crate::domain::job::{JobRecord, JobResult, OutputFields, ProcessingConfig, StageName};
use crate::domain::transcript::{label_speakers, render_transcript, AudioRef, Transcriber};
use crate::infra::audio::{self, AudioEnhancer};
use crate::infra::extraction_validator::ExtractionValidator;
use crate::infra::extractor::prompts::sanitize_user_query;
use crate::infra::extractor::Extractor;
use crate::infra::metrics::Metrics;
use crate::infra::query_parser::QueryResultParser;
use crate::infra::storage::{NewMeeting, Storage};
use crate::usecase::job_registry::JobRegistry;
use crate::usecase::reconciler::CalendarReconciler;

/// 「質問のみ」モードで標準要約の代わりに入れる文言
pub const CUSTOM_FIELD_ONLY_SUMMARY: &str = "Custom-field-only mode: standard summary skipped";

/// パイプラインの外部コラボレータ（設定から差し替え可能）
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub extractor: Arc<dyn Extractor>,
    pub enhancer: Arc<dyn AudioEnhancer>,
}

/// 実行中ジョブへのハンドル
pub struct JobHandle {
    pub job_id: String,
    /// ワーカーの終了を見届ける監視タスク
    handle: JoinHandle<()>,
    worker: AbortHandle,
    registry: Arc<JobRegistry>,
}

impl JobHandle {
    /// ジョブのタスク終了を待つ。ジョブ自体の成否はレジストリで確認する。
    pub async fn wait(self) -> Result<(), AppError> {
        self.handle
            .await
            .map_err(|e| AppError::internal(format!("ジョブタスクが異常終了しました: {e}")))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// タスクを中断し、実行中ステージを失敗として記録する。
    pub fn abort(&self) {
        self.worker.abort();
        if let Err(e) = fail_current_stage(&self.registry, &self.job_id, "aborted") {
            log::debug!("ジョブ {} は既に終了しています: {e}", self.job_id);
        }
    }
}

/// 実行中のステージ（未開始なら最初のステージ）を失敗にする。
fn fail_current_stage(
    registry: &JobRegistry,
    job_id: &str,
    message: &str,
) -> Result<(), AppError> {
    registry.update(job_id, |r| {
        let stage = match r.current_stage() {
            Some(stage) => stage,
            None => {
                r.start()?;
                StageName::ALL[0]
            }
        };
        r.fail(stage, message, 0)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

/// ジョブオーケストレータ: ステージを順に実行し、遷移のたびにレジストリを更新する。
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    registry: Arc<JobRegistry>,
    storage: Arc<Storage>,
    reconciler: Arc<CalendarReconciler>,
    collaborators: Collaborators,
    metrics: Arc<Metrics>,
}

struct RunContext {
    job_id: String,
    owner_id: String,
    created_at: String,
    audio: AudioRef,
    config: ProcessingConfig,
    started: Instant,
}

struct StageTimer {
    stage: StageName,
    started: Instant,
}

struct StageFailure {
    stage: StageName,
    error: AppError,
    duration_ms: u64,
}

impl StageTimer {
    fn start(stage: StageName) -> Self {
        Self {
            stage,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn fail(&self, error: AppError) -> StageFailure {
        StageFailure {
            stage: self.stage,
            error,
            duration_ms: self.elapsed_ms(),
        }
    }
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        storage: Arc<Storage>,
        reconciler: Arc<CalendarReconciler>,
        collaborators: Collaborators,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                storage,
                reconciler,
                collaborators,
                metrics,
            }),
        }
    }

    /// ジョブを登録してバックグラウンドで実行する。登録後すぐに戻る。
    ///
    /// tokio ランタイム上で呼ぶこと。
    pub fn submit(
        &self,
        owner_id: &str,
        audio: AudioRef,
        config: ProcessingConfig,
    ) -> Result<JobHandle, AppError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        self.inner.registry.insert(JobRecord::new(
            job_id.clone(),
            owner_id.to_string(),
            created_at.clone(),
        ))?;
        self.inner.metrics.inc_jobs_submitted();
        log::info!("ジョブを受け付けました: {job_id} (owner={owner_id})");

        let ctx = RunContext {
            job_id: job_id.clone(),
            owner_id: owner_id.to_string(),
            created_at,
            audio,
            config,
            started: Instant::now(),
        };
        let upload = ctx.audio.path.clone();
        let this = self.clone();
        let worker = tokio::spawn(async move { this.run(ctx).await });
        let abort = worker.abort_handle();

        let this = self.clone();
        let supervised = job_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.await {
                this.record_crash(&supervised, &upload, e);
            }
        });

        Ok(JobHandle {
            job_id,
            handle,
            worker: abort,
            registry: self.inner.registry.clone(),
        })
    }

    /// ワーカーが panic または中断で終わった場合の後始末。
    /// ジョブを `processing` のまま残さない。
    fn record_crash(&self, job_id: &str, upload: &Path, error: JoinError) {
        let message = if error.is_panic() {
            let message = format!("internal error: {}", panic_message(&*error.into_panic()));
            log::error!("ジョブ {job_id} のタスクが panic しました: {message}");
            message
        } else {
            "aborted".to_string()
        };

        match fail_current_stage(&self.inner.registry, job_id, &message) {
            Ok(()) => {
                self.inner.metrics.inc_jobs_failed();
                self.inner.metrics.inc_error(ErrorCode::Internal);
            }
            Err(e) => log::debug!("ジョブ {job_id} は既に終了しています: {e}"),
        }
        self.cleanup_upload(upload);
    }

    async fn run(&self, ctx: RunContext) {
        if let Err(e) = self.inner.registry.update(&ctx.job_id, |r| r.start()) {
            log::error!("ジョブ {} を開始できません: {e}", ctx.job_id);
            return;
        }

        let mut scratch: Vec<PathBuf> = Vec::new();
        match self.execute(&ctx, &mut scratch).await {
            Ok(()) => {
                self.inner.metrics.inc_jobs_completed();
                log::info!(
                    "ジョブ {} 完了 ({:.1}s)",
                    ctx.job_id,
                    ctx.started.elapsed().as_secs_f64()
                );
            }
            Err(failure) => {
                log::error!(
                    "ジョブ {} は {} で失敗しました: {}",
                    ctx.job_id,
                    failure.stage.as_str(),
                    failure.error
                );
                self.inner.metrics.inc_jobs_failed();
                self.inner.metrics.inc_error(failure.error.code);
                let message = failure.error.message;
                if let Err(e) = self.inner.registry.update(&ctx.job_id, |r| {
                    r.fail(failure.stage, message, failure.duration_ms)
                }) {
                    log::error!("ジョブ {} の失敗を記録できません: {e}", ctx.job_id);
                }
            }
        }

        self.cleanup_files(&ctx, &scratch);
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        scratch: &mut Vec<PathBuf>,
    ) -> Result<(), StageFailure> {
        let inner = &self.inner;
        let fields = &ctx.config.output_fields;

        // ─── vad ───
        let timer = StageTimer::start(StageName::Vad);
        let input = ctx.audio.clone();
        let probe = tokio::task::spawn_blocking(move || audio::probe(&input))
            .await
            .map_err(|e| timer.fail(AppError::internal(format!("音声解析タスク失敗: {e}"))))?
            .map_err(|e| timer.fail(AppError::invalid_input(e.to_string())))?;
        if probe.speech_ratio == Some(0.0) {
            log::warn!("ジョブ {}: 入力に発話区間が見つかりません", ctx.job_id);
        }
        self.advance(ctx, &timer)?;

        // ─── enhancement ───
        let timer = StageTimer::start(StageName::Enhancement);
        let audio = match inner.collaborators.enhancer.enhance(&ctx.audio).await {
            Ok(enhanced) => {
                if enhanced.path != ctx.audio.path {
                    scratch.push(enhanced.path.clone());
                }
                enhanced
            }
            Err(e) => {
                log::warn!(
                    "ジョブ {}: エンハンスに失敗したため元の音声を使います: {e}",
                    ctx.job_id
                );
                ctx.audio.clone()
            }
        };
        self.advance(ctx, &timer)?;

        // ─── transcription ───
        let timer = StageTimer::start(StageName::Transcription);
        let mut utterances = inner
            .collaborators
            .transcriber
            .transcribe(&audio)
            .await
            .map_err(|e| timer.fail(AppError::transcription(e.to_string())))?;
        if utterances.is_empty() {
            return Err(timer.fail(AppError::transcription("No speech detected")));
        }
        self.advance(ctx, &timer)?;

        // ─── diarization ───
        let timer = StageTimer::start(StageName::Diarization);
        label_speakers(&mut utterances);
        self.report(ctx, StageName::Diarization, 50);
        let transcript = render_transcript(&utterances);
        self.advance(ctx, &timer)?;

        // ─── extraction ───
        let timer = StageTimer::start(StageName::Extraction);
        let user_query = ctx
            .config
            .user_query
            .as_deref()
            .map(sanitize_user_query)
            .filter(|q| !q.is_empty());
        let raw = inner
            .collaborators
            .extractor
            .extract(&transcript, user_query.as_deref(), &ctx.config)
            .await
            .map_err(|e| timer.fail(AppError::extraction(e.to_string())))?;
        self.report(ctx, StageName::Extraction, 60);

        let mut extraction = ExtractionValidator::validate(&raw);
        if ctx.config.custom_field_only {
            apply_custom_field_only(&mut extraction);
        }
        apply_output_fields(&mut extraction, fields);
        extraction.reset_sync_state();
        self.advance(ctx, &timer)?;

        // ─── calendar ───
        let timer = StageTimer::start(StageName::Calendar);
        let transcript = if fields.transcript {
            transcript
        } else {
            String::new()
        };
        let processing_secs = ctx.started.elapsed().as_secs_f64();
        inner
            .storage
            .save_job_result(&NewMeeting {
                job_id: &ctx.job_id,
                owner_id: &ctx.owner_id,
                created_at: &ctx.created_at,
                transcript: &transcript,
                extraction: &extraction,
                user_query: user_query.as_deref(),
                audio_duration_secs: probe.duration_secs,
                processing_secs,
            })
            .map_err(|e| timer.fail(e))?;

        let mut calendar_event_links = Vec::new();
        if fields.calendar_sync && !extraction.dated_events.is_empty() {
            match inner.reconciler.sync_job(&ctx.job_id, &ctx.owner_id).await {
                Ok(report) => {
                    inner.metrics.add_calendar_results(report.posted, report.failed);
                    calendar_event_links = report.event_links;
                }
                Err(e) => {
                    // 成果物は保存済みなので、同期失敗でジョブは失敗させない
                    log::warn!("ジョブ {}: カレンダー同期をスキップしました: {e}", ctx.job_id);
                    inner.metrics.inc_error(e.code);
                }
            }
        }

        let dated_events = inner
            .storage
            .list_dated_events(&ctx.job_id, false)
            .unwrap_or_else(|e| {
                log::warn!("ジョブ {}: 保存済みイベントを読めません: {e}", ctx.job_id);
                extraction.dated_events.clone()
            });
        let notes = inner.storage.list_notes(&ctx.job_id).unwrap_or_else(|e| {
            log::warn!("ジョブ {}: 保存済みメモを読めません: {e}", ctx.job_id);
            extraction.notes.clone()
        });

        let result = JobResult {
            job_id: ctx.job_id.clone(),
            transcript,
            final_summary: extraction.final_summary,
            dated_events,
            notes,
            user_requested_data: extraction.user_requested_data,
            calendar_event_links,
            audio_duration_secs: probe.duration_secs,
            processing_secs,
        };

        // 最終ステージの完了と結果の確定は1回の更新で行う
        let duration_ms = timer.elapsed_ms();
        inner.metrics.record_stage_latency(StageName::Calendar, duration_ms);
        inner
            .registry
            .update(&ctx.job_id, |r| {
                r.advance(StageName::Calendar, duration_ms)?;
                r.complete(result)
            })
            .map_err(|e| timer.fail(e))
    }

    /// ステージを完了し、次のステージを開始する。
    fn advance(&self, ctx: &RunContext, timer: &StageTimer) -> Result<(), StageFailure> {
        let duration_ms = timer.elapsed_ms();
        self.inner
            .registry
            .update(&ctx.job_id, |r| r.advance(timer.stage, duration_ms))
            .map_err(|e| timer.fail(e))?;
        self.inner
            .metrics
            .record_stage_latency(timer.stage, duration_ms);
        log::info!(
            "ジョブ {}: {} 完了 ({duration_ms}ms)",
            ctx.job_id,
            timer.stage.as_str()
        );
        Ok(())
    }

    fn report(&self, ctx: &RunContext, stage: StageName, progress: u8) {
        if let Err(e) = self
            .inner
            .registry
            .update(&ctx.job_id, |r| r.report_progress(stage, progress))
        {
            log::warn!("ジョブ {}: 進捗を更新できません: {e}", ctx.job_id);
        }
    }

    /// 中間ファイルを削除し、設定に応じてアップロードも削除する。
    fn cleanup_files(&self, ctx: &RunContext, scratch: &[PathBuf]) {
        for path in scratch {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("中間ファイルを削除できません {path:?}: {e}");
            }
        }

        self.cleanup_upload(&ctx.audio.path);
    }

    /// 設定でアップロードの保持が無効なら削除する。設定を読めなければ残す。
    fn cleanup_upload(&self, upload: &Path) {
        let retain = match self.inner.storage.get_settings() {
            Ok(settings) => settings.retain_uploads,
            Err(e) => {
                log::warn!("設定を読めないためアップロードを残します: {e}");
                true
            }
        };
        if retain {
            return;
        }
        match std::fs::remove_file(upload) {
            Ok(()) => log::debug!("アップロードを削除しました: {upload:?}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("アップロードを削除できません {upload:?}: {e}"),
        }
    }
}

/// 「質問のみ」モード: 要約を差し替え、イベントとメモを質問回答から組み立てる。
fn apply_custom_field_only(extraction: &mut ExtractionResult) {
    let parsed = extraction
        .user_requested_data
        .as_ref()
        .map(QueryResultParser::parse)
        .unwrap_or_default();

    extraction.final_summary = FinalSummary {
        english: CUSTOM_FIELD_ONLY_SUMMARY.to_string(),
        translations: Default::default(),
    };
    extraction.dated_events = parsed.dated_events;
    extraction.notes = parsed.notes;
    ExtractionValidator::normalize(extraction);
}

/// 出力項目の選択で無効化された内容を取り除く。
fn apply_output_fields(extraction: &mut ExtractionResult, fields: &OutputFields) {
    if !fields.summary_english {
        extraction.final_summary.english.clear();
    }
    if !fields.summary_arabic {
        extraction.final_summary.translations.remove("arabic");
    }
    if !fields.action_items && !fields.deadlines {
        extraction.dated_events.clear();
    }
    extraction.notes.retain(|note| match note.category {
        NoteCategory::Budget => fields.budget_notes,
        NoteCategory::Decision => fields.decisions,
        NoteCategory::General => fields.general_notes,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extraction::{Note, UserRequestedData};
    use crate::domain::job::{JobStatus, StageStatus};
    use crate::domain::transcript::{TranscriptionError, Utterance};
    use crate::infra::audio::PassthroughEnhancer;
    use crate::infra::calendar::NoopCalendarProvider;
    use crate::infra::extractor::NoopExtractor;
    use crate::infra::stt::NoopTranscriber;

    fn note(category: NoteCategory) -> Note {
        Note {
            id: None,
            category,
            title: category.as_str().into(),
            description: String::new(),
            urgent: false,
            manual: false,
        }
    }

    #[test]
    fn output_fields_filter_notes_and_translations() {
        let mut extraction = ExtractionValidator::validate(&serde_json::json!({
            "key_takeaways": {"english": "• en", "arabic": "• ar"},
            "dated_events": [{"title": "x", "date": "2025-12-01"}],
        }));
        extraction.notes = vec![
            note(NoteCategory::Budget),
            note(NoteCategory::Decision),
            note(NoteCategory::General),
        ];
        let fields = OutputFields {
            summary_arabic: false,
            decisions: false,
            action_items: false,
            ..Default::default()
        };

        apply_output_fields(&mut extraction, &fields);
        assert!(extraction.final_summary.translations.is_empty());
        assert_eq!(extraction.final_summary.english, "• en");
        // deadlines が有効なのでイベントは残る
        assert_eq!(extraction.dated_events.len(), 1);
        let categories: Vec<_> = extraction.notes.iter().map(|n| n.category).collect();
        assert_eq!(categories, vec![NoteCategory::Budget, NoteCategory::General]);
    }

    #[test]
    fn custom_field_only_replaces_summary_and_items() {
        let mut extraction = ExtractionValidator::validate(&serde_json::json!({
            "key_takeaways": {"english": "• normal summary"},
            "dated_events": [{"title": "ignored", "date": "2025-01-01"}],
            "user_requested_data": {
                "type": "list",
                "content": "Review on 2025-12-05. Kickoff on 2025-12-01."
            }
        }));

        apply_custom_field_only(&mut extraction);
        assert_eq!(extraction.final_summary.english, CUSTOM_FIELD_ONLY_SUMMARY);
        let dates: Vec<_> = extraction.dated_events.iter().map(|e| e.date.as_str()).collect();
        assert_eq!(dates, vec!["2025-12-01", "2025-12-05"]);
        assert_eq!(extraction.dated_events[0].formatted_date, "December 1, 2025");
        assert_eq!(extraction.notes.len(), 1);
        assert_eq!(
            extraction.user_requested_data,
            Some(UserRequestedData {
                kind: Some("list".into()),
                content: Some("Review on 2025-12-05. Kickoff on 2025-12-01.".into()),
            })
        );
    }

    /// 文字起こしの途中で panic する
    struct PanickingTranscriber;

    #[async_trait::async_trait]
    impl Transcriber for PanickingTranscriber {
        async fn transcribe(
            &self,
            _audio: &AudioRef,
        ) -> Result<Vec<Utterance>, TranscriptionError> {
            panic!("decoder state corrupted")
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    fn orchestrator() -> (JobOrchestrator, Arc<JobRegistry>) {
        orchestrator_with(Arc::new(NoopTranscriber))
    }

    fn orchestrator_with(
        transcriber: Arc<dyn Transcriber>,
    ) -> (JobOrchestrator, Arc<JobRegistry>) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let registry = Arc::new(JobRegistry::new());
        let reconciler = Arc::new(CalendarReconciler::new(
            storage.clone(),
            Arc::new(NoopCalendarProvider),
        ));
        let collaborators = Collaborators {
            transcriber,
            extractor: Arc::new(NoopExtractor),
            enhancer: Arc::new(PassthroughEnhancer),
        };
        let orchestrator = JobOrchestrator::new(
            registry.clone(),
            storage,
            reconciler,
            collaborators,
            Arc::new(Metrics::new()),
        );
        (orchestrator, registry)
    }

    #[tokio::test]
    async fn noop_pipeline_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meeting.m4a");
        std::fs::write(&path, b"audio").unwrap();

        let (orchestrator, registry) = orchestrator();
        let handle = orchestrator
            .submit("alice", AudioRef::new(&path), ProcessingConfig::default())
            .unwrap();
        let job_id = handle.job_id.clone();
        handle.wait().await.unwrap();

        let record = registry.get(&job_id).unwrap();
        assert_eq!(record.status(), JobStatus::Completed);
        assert_eq!(record.overall_progress(), 100);
        let result = record.result().unwrap();
        assert!(result.transcript.starts_with("[00:00 - 00:01] Speaker A:"));
        assert!(result.calendar_event_links.is_empty());
        // 既定ではアップロードを削除する
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_input_fails_at_vad() {
        let (orchestrator, registry) = orchestrator();
        let handle = orchestrator
            .submit(
                "alice",
                AudioRef::new("/nonexistent/meeting.wav"),
                ProcessingConfig::default(),
            )
            .unwrap();
        let job_id = handle.job_id.clone();
        handle.wait().await.unwrap();

        let record = registry.get(&job_id).unwrap();
        assert_eq!(record.status(), JobStatus::Failed);
        assert_eq!(record.stage(StageName::Vad).status, StageStatus::Failed);
        assert_eq!(
            record.stage(StageName::Enhancement).status,
            StageStatus::Pending
        );
        assert!(record
            .error()
            .unwrap()
            .starts_with("Voice activity detection failed:"));
    }

    #[tokio::test]
    async fn panicking_transcriber_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meeting.m4a");
        std::fs::write(&path, b"audio").unwrap();

        let (orchestrator, registry) = orchestrator_with(Arc::new(PanickingTranscriber));
        let handle = orchestrator
            .submit("alice", AudioRef::new(&path), ProcessingConfig::default())
            .unwrap();
        let job_id = handle.job_id.clone();
        handle.wait().await.unwrap();

        let record = registry.get(&job_id).unwrap();
        assert_eq!(record.status(), JobStatus::Failed);
        assert_eq!(record.stage(StageName::Enhancement).status, StageStatus::Complete);
        assert_eq!(
            record.stage(StageName::Transcription).status,
            StageStatus::Failed
        );
        let error = record.error().unwrap();
        assert!(error.starts_with("Transcription failed: internal error:"));
        assert!(error.contains("decoder state corrupted"));
        assert!(!path.exists());
        assert_eq!(
            orchestrator.inner.metrics.summary().error_counts.get("E_INTERNAL"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn wav_duration_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standup.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..16_000 {
            let t = i as f32 / 16_000.0;
            let sample = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
            writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let (orchestrator, registry) = orchestrator();
        let handle = orchestrator
            .submit("alice", AudioRef::new(&path), ProcessingConfig::default())
            .unwrap();
        let job_id = handle.job_id.clone();
        handle.wait().await.unwrap();

        let record = registry.get(&job_id).unwrap();
        assert_eq!(record.status(), JobStatus::Completed);
        let duration = record.result().unwrap().audio_duration_secs.unwrap();
        assert!((duration - 1.0).abs() < 1e-6);
    }
}
