use std::sync::Arc;

use chrono::Utc;

use crate::domain::calendar::{CalendarCredential, SyncReport};
use crate::domain::error::AppError;
use crate::domain::extraction::{DatedEvent, Note, NoteCategory};
use crate::domain::job::{JobResult, JobStatus, JobStatusView, ProcessingConfig};
use crate::domain::settings::PipelineSettings;
use crate::domain::transcript::AudioRef;
use crate::domain::types::{
    HistoryPage, ItemKind, ItemOwner, MeetingAnalytics, MeetingDetail, Preset,
};
use crate::infra::calendar::CalendarProvider;
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::infra::storage::Storage;
use crate::usecase::job_registry::JobRegistry;
use crate::usecase::orchestrator::{Collaborators, JobHandle, JobOrchestrator};
use crate::usecase::reconciler::CalendarReconciler;

/// 履歴一覧の既定件数と上限
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// 会議パイプラインのサービス層（外部から呼ばれる操作の入口）
pub struct MeetingService {
    registry: Arc<JobRegistry>,
    storage: Arc<Storage>,
    reconciler: Arc<CalendarReconciler>,
    orchestrator: JobOrchestrator,
    metrics: Arc<Metrics>,
}

impl MeetingService {
    pub fn new(
        storage: Arc<Storage>,
        collaborators: Collaborators,
        calendar: Arc<dyn CalendarProvider>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let reconciler = Arc::new(CalendarReconciler::new(storage.clone(), calendar));
        let orchestrator = JobOrchestrator::new(
            registry.clone(),
            storage.clone(),
            reconciler.clone(),
            collaborators,
            metrics.clone(),
        );
        Self {
            registry,
            storage,
            reconciler,
            orchestrator,
            metrics,
        }
    }

    // ==================== Jobs ====================

    /// ジョブを投入し、job_id を返す。処理はバックグラウンドで進む。
    pub fn submit_job(
        &self,
        owner_id: &str,
        audio: AudioRef,
        config: ProcessingConfig,
    ) -> Result<String, AppError> {
        Ok(self.submit(owner_id, audio, config)?.job_id)
    }

    /// `submit_job` と同じだが、完了を待てるハンドルを返す。
    pub fn submit(
        &self,
        owner_id: &str,
        audio: AudioRef,
        config: ProcessingConfig,
    ) -> Result<JobHandle, AppError> {
        if owner_id.trim().is_empty() {
            return Err(AppError::invalid_input("owner_id is required"));
        }
        self.orchestrator.submit(owner_id, audio, config)
    }

    pub fn get_status(&self, job_id: &str, owner_id: &str) -> Result<JobStatusView, AppError> {
        let record = self
            .registry
            .get(job_id)
            .ok_or_else(|| AppError::not_found(format!("Job not found: {job_id}")))?;
        if !record.is_owned_by(owner_id) {
            return Err(forbidden());
        }
        Ok(record.status_view())
    }

    /// 完了ジョブの成果物を返す。
    ///
    /// レジストリから掃除済みのジョブは保存済みの会議から組み立てる。
    pub fn get_result(&self, job_id: &str, owner_id: &str) -> Result<JobResult, AppError> {
        let Some(record) = self.registry.get(job_id) else {
            return self.stored_result(job_id, owner_id);
        };
        if !record.is_owned_by(owner_id) {
            return Err(forbidden());
        }

        match record.status() {
            JobStatus::Processing => Err(AppError::not_ready(format!(
                "Job is still processing ({}%)",
                record.overall_progress()
            ))),
            JobStatus::Failed => Err(AppError::job_failed(
                record.error().unwrap_or("Job failed").to_string(),
            )),
            JobStatus::Completed => {
                let mut result = record.result().cloned().ok_or_else(|| {
                    AppError::internal(format!("完了ジョブに結果がありません: {job_id}"))
                })?;
                self.refresh_items(&mut result);
                Ok(result)
            }
        }
    }

    /// 保存済みのアイテムで結果を上書きする（手動同期や編集を反映）。
    /// 読み込みに失敗した場合は完了時点の結果を返す。
    fn refresh_items(&self, result: &mut JobResult) {
        match self.storage.get_meeting_detail(&result.job_id) {
            Ok(Some(detail)) => {
                result.calendar_event_links = calendar_links(&detail.dated_events);
                result.dated_events = detail.dated_events;
                result.notes = detail.notes;
            }
            Ok(None) => {}
            Err(e) => log::warn!("保存済みアイテムの読み込みに失敗しました ({}): {e}", result.job_id),
        }
    }

    fn stored_result(&self, job_id: &str, owner_id: &str) -> Result<JobResult, AppError> {
        let detail = self.owned_meeting(job_id, owner_id)?;
        let calendar_event_links = calendar_links(&detail.dated_events);
        Ok(JobResult {
            job_id: detail.job_id,
            transcript: detail.transcript,
            final_summary: detail.final_summary,
            dated_events: detail.dated_events,
            notes: detail.notes,
            user_requested_data: detail.user_requested_data,
            calendar_event_links,
            audio_duration_secs: detail.audio_duration_secs,
            processing_secs: detail.processing_secs.unwrap_or_default(),
        })
    }

    /// 手動同期。未同期のイベントだけを投稿する。
    pub async fn trigger_calendar_sync(
        &self,
        job_id: &str,
        owner_id: &str,
    ) -> Result<SyncReport, AppError> {
        if let Some(record) = self.registry.get(job_id) {
            if !record.is_owned_by(owner_id) {
                return Err(forbidden());
            }
            if record.status() == JobStatus::Processing {
                return Err(AppError::not_ready("Job is still processing"));
            }
        }

        match self.storage.get_meeting_owner(job_id)? {
            None => return Err(AppError::not_found(format!("Meeting not found: {job_id}"))),
            Some(owner) if owner != owner_id => return Err(forbidden()),
            Some(_) => {}
        }

        log::info!(
            "手動カレンダー同期: job={job_id} provider={}",
            self.reconciler.provider_name()
        );
        match self.reconciler.sync_job(job_id, owner_id).await {
            Ok(report) => {
                self.metrics.add_calendar_results(report.posted, report.failed);
                Ok(report)
            }
            Err(e) => {
                self.metrics.inc_error(e.code);
                Err(e)
            }
        }
    }

    /// 終了済みジョブをレジストリから外す。成果物は保存済みなので失われない。
    pub fn cleanup_finished_jobs(&self) -> usize {
        let removed = self.registry.cleanup_finished();
        if removed > 0 {
            log::info!("終了済みジョブを {removed} 件削除しました");
        }
        removed
    }

    // ==================== History ====================

    pub fn list_meetings(
        &self,
        owner_id: &str,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, AppError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.storage.list_meetings(owner_id, limit, cursor)
    }

    pub fn get_meeting(&self, job_id: &str, owner_id: &str) -> Result<MeetingDetail, AppError> {
        self.owned_meeting(job_id, owner_id)
    }

    /// 会議と付随アイテムを削除する。処理中のジョブは削除できない。
    pub fn delete_meeting(&self, job_id: &str, owner_id: &str) -> Result<(), AppError> {
        if let Some(record) = self.registry.get(job_id) {
            if !record.is_owned_by(owner_id) {
                return Err(forbidden());
            }
            if record.status() == JobStatus::Processing {
                return Err(AppError::invalid_state("Job is still processing"));
            }
        }
        match self.storage.get_meeting_owner(job_id)? {
            None => Err(AppError::not_found(format!("Meeting not found: {job_id}"))),
            Some(owner) if owner != owner_id => Err(forbidden()),
            Some(_) => {
                self.storage.delete_meeting(job_id)?;
                self.registry.remove(job_id);
                log::info!("会議を削除しました: {job_id}");
                Ok(())
            }
        }
    }

    fn owned_meeting(&self, job_id: &str, owner_id: &str) -> Result<MeetingDetail, AppError> {
        let detail = self
            .storage
            .get_meeting_detail(job_id)?
            .ok_or_else(|| AppError::not_found(format!("Meeting not found: {job_id}")))?;
        if detail.owner_id != owner_id {
            return Err(forbidden());
        }
        Ok(detail)
    }

    // ==================== Items ====================

    /// 会議に手動でメモを追加する。
    pub fn add_note(
        &self,
        job_id: &str,
        owner_id: &str,
        category: &str,
        title: &str,
        description: &str,
    ) -> Result<Note, AppError> {
        let category = NoteCategory::parse(category).ok_or_else(|| {
            AppError::invalid_input("Invalid category. Must be one of: BUDGET, DECISION, GENERAL")
        })?;
        if title.trim().is_empty() {
            return Err(AppError::invalid_input("Note title is required"));
        }
        match self.storage.get_meeting_owner(job_id)? {
            None => return Err(AppError::not_found(format!("Meeting not found: {job_id}"))),
            Some(owner) if owner != owner_id => return Err(forbidden()),
            Some(_) => {}
        }

        let mut note = Note {
            id: None,
            category,
            title: title.trim().to_string(),
            description: description.trim().to_string(),
            urgent: false,
            manual: true,
        };
        note.id = Some(self.storage.add_note(job_id, &note)?);
        Ok(note)
    }

    /// タスクの完了チェックを切り替える。カレンダー同期状態には触れない。
    pub fn set_task_completed(
        &self,
        item_id: &str,
        owner_id: &str,
        completed: bool,
    ) -> Result<(), AppError> {
        self.owned_item(item_id, owner_id, ItemKind::DatedEvent)?;
        if !self.storage.set_event_completed(item_id, completed)? {
            return Err(item_not_found(item_id, ItemKind::DatedEvent));
        }
        Ok(())
    }

    pub fn delete_event(&self, item_id: &str, owner_id: &str) -> Result<(), AppError> {
        self.delete_item(item_id, owner_id, ItemKind::DatedEvent)
    }

    pub fn delete_note(&self, item_id: &str, owner_id: &str) -> Result<(), AppError> {
        self.delete_item(item_id, owner_id, ItemKind::Note)
    }

    fn delete_item(&self, item_id: &str, owner_id: &str, kind: ItemKind) -> Result<(), AppError> {
        let owner = self.owned_item(item_id, owner_id, kind)?;
        if !self.storage.delete_item(item_id, kind)? {
            return Err(item_not_found(item_id, kind));
        }
        log::info!("アイテムを削除しました: job={} item={item_id}", owner.job_id);
        Ok(())
    }

    /// 種別が違うアイテムは存在しないものとして扱う。
    fn owned_item(
        &self,
        item_id: &str,
        owner_id: &str,
        kind: ItemKind,
    ) -> Result<ItemOwner, AppError> {
        let owner = self
            .storage
            .item_owner(item_id)?
            .filter(|o| o.kind == kind)
            .ok_or_else(|| item_not_found(item_id, kind))?;
        if owner.owner_id != owner_id {
            return Err(forbidden());
        }
        Ok(owner)
    }

    // ==================== Analytics ====================

    pub fn get_analytics(&self, owner_id: &str) -> Result<MeetingAnalytics, AppError> {
        self.storage.owner_analytics(owner_id, Utc::now())
    }

    // ==================== Presets ====================

    pub fn save_preset(&self, owner_id: &str, mut preset: Preset) -> Result<String, AppError> {
        if preset.name.trim().is_empty() {
            return Err(AppError::invalid_input("Preset name is required"));
        }
        preset.owner_id = owner_id.to_string();
        self.storage.save_preset(&preset)
    }

    pub fn list_presets(&self, owner_id: &str) -> Result<Vec<Preset>, AppError> {
        self.storage.list_presets(owner_id)
    }

    pub fn delete_preset(&self, owner_id: &str, preset_id: &str) -> Result<(), AppError> {
        if self.storage.delete_preset(owner_id, preset_id)? {
            Ok(())
        } else {
            Err(AppError::not_found(format!("Preset not found: {preset_id}")))
        }
    }

    // ==================== Calendar ====================

    /// 発行済みの認証情報を登録する（OAuth フロー自体は扱わない）。
    pub fn connect_calendar(
        &self,
        owner_id: &str,
        mut credential: CalendarCredential,
    ) -> Result<(), AppError> {
        if credential.access_token.trim().is_empty() {
            return Err(AppError::invalid_input("access_token is required"));
        }
        credential.connected = true;
        self.storage.save_calendar_credential(owner_id, &credential)?;
        log::info!("カレンダーを連携しました: owner={owner_id}");
        Ok(())
    }

    pub fn disconnect_calendar(&self, owner_id: &str) -> Result<(), AppError> {
        if self.storage.disconnect_calendar(owner_id)? {
            log::info!("カレンダー連携を解除しました: owner={owner_id}");
        }
        Ok(())
    }

    // ==================== Settings ====================

    pub fn get_settings(&self) -> Result<PipelineSettings, AppError> {
        self.storage.get_settings()
    }

    /// 設定を保存する。エンジン選択の変更は次回起動時に反映される。
    pub fn update_settings(&self, settings: &PipelineSettings) -> Result<(), AppError> {
        self.storage.save_settings(settings)
    }

    // ==================== Metrics ====================

    pub fn get_metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}

fn forbidden() -> AppError {
    AppError::forbidden("Not authorized to access this job")
}

fn item_not_found(item_id: &str, kind: ItemKind) -> AppError {
    match kind {
        ItemKind::DatedEvent => AppError::not_found(format!("Event not found: {item_id}")),
        ItemKind::Note => AppError::not_found(format!("Note not found: {item_id}")),
    }
}

fn calendar_links(events: &[DatedEvent]) -> Vec<String> {
    events.iter().filter_map(|e| e.calendar_link.clone()).collect()
}
