use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::calendar::{CalendarCredential, SyncReport};
use crate::domain::error::AppError;
use crate::domain::extraction::DatedEvent;
use crate::infra::calendar::CalendarProvider;
use crate::infra::storage::Storage;

/// 1回の照合の結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// 今回投稿できたイベントのリンク（投稿順）
    pub links: Vec<String>,
    /// (item_id, link)。永続化済みアイテムのみ
    pub posted: Vec<(String, String)>,
    pub failed: u32,
    /// 期限切れのため更新した認証情報
    pub refreshed: Option<CalendarCredential>,
}

/// カレンダー照合: 未同期の日付付きイベントだけを投稿し、同期済みに記録する。
///
/// 同じジョブへの照合はジョブ単位の非同期ロックで直列化される。
/// 自動同期（パイプライン）と手動同期が同時に走っても二重投稿しない。
pub struct CalendarReconciler {
    storage: Arc<Storage>,
    provider: Arc<dyn CalendarProvider>,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CalendarReconciler {
    pub fn new(storage: Arc<Storage>, provider: Arc<dyn CalendarProvider>) -> Self {
        Self {
            storage,
            provider,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// 認証情報とイベント列から投稿を行う（ストレージには触れない）。
    ///
    /// - 未連携 → `E_CALENDAR_NOT_CONNECTED`
    /// - `synced` のイベントは投稿しない
    /// - 期限切れなら投稿前に更新し、結果の `refreshed` で返す
    /// - 個別の投稿失敗はログに残して続行する
    pub async fn reconcile(
        &self,
        credential: &CalendarCredential,
        items: &[DatedEvent],
    ) -> Result<ReconcileOutcome, AppError> {
        ensure_connected(credential)?;

        let pending: Vec<&DatedEvent> = items.iter().filter(|e| !e.synced).collect();
        if pending.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        let mut outcome = ReconcileOutcome::default();
        let mut active = credential.clone();
        if active.is_expired(chrono::Utc::now()) {
            if !active.can_refresh() {
                return Err(AppError::calendar(
                    "Calendar access expired and cannot be refreshed; reconnect the calendar",
                ));
            }
            let rotated = self
                .provider
                .refresh_credential(&active)
                .await
                .map_err(|e| AppError::calendar(e.to_string()))?;
            active = rotated.clone();
            outcome.refreshed = Some(rotated);
        }

        for event in pending {
            match self.provider.post_event(&active, event).await {
                Ok(link) => {
                    log::info!("カレンダーに投稿しました: {}", event.title);
                    if let Some(id) = &event.id {
                        outcome.posted.push((id.clone(), link.clone()));
                    } else {
                        log::warn!("未保存のイベントは同期済みに記録できません: {}", event.title);
                    }
                    outcome.links.push(link);
                }
                Err(e) => {
                    log::warn!("カレンダー投稿に失敗しました ({}): {e}", event.title);
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// 保存済みジョブの未同期イベントを照合する。
    ///
    /// 読み取り → 投稿 → 書き戻しの間ジョブ単位のロックを保持する。
    /// 更新された認証情報は成功を返す前に保存する。
    pub async fn sync_job(&self, job_id: &str, owner_id: &str) -> Result<SyncReport, AppError> {
        let lock = self.job_lock(job_id);
        let result = {
            let _guard = lock.lock().await;
            self.sync_locked(job_id, owner_id).await
        };
        self.release_lock(job_id, lock);
        result
    }

    async fn sync_locked(&self, job_id: &str, owner_id: &str) -> Result<SyncReport, AppError> {
        let credential = self
            .storage
            .get_calendar_credential(owner_id)?
            .ok_or_else(|| AppError::calendar_not_connected("Calendar is not connected"))?;
        ensure_connected(&credential)?;

        let pending = self.storage.list_dated_events(job_id, true)?;
        if pending.is_empty() {
            log::info!("ジョブ {job_id}: 同期対象のイベントはありません");
            return Ok(SyncReport {
                already_synced: true,
                ..Default::default()
            });
        }

        let outcome = self.reconcile(&credential, &pending).await?;

        // 投稿済みを先に記録し、再試行で二重投稿しないようにする
        self.storage.mark_events_synced(job_id, &outcome.posted)?;

        if let Some(rotated) = &outcome.refreshed {
            if let Err(e) = self.storage.save_calendar_credential(owner_id, rotated) {
                log::error!("更新した認証情報を保存できません (owner={owner_id}): {e}");
                return Err(e);
            }
            log::info!("更新した認証情報を保存しました (owner={owner_id})");
        }

        log::info!(
            "ジョブ {job_id}: カレンダー同期 posted={} failed={}",
            outcome.links.len(),
            outcome.failed
        );

        Ok(SyncReport {
            posted: outcome.links.len() as u32,
            failed: outcome.failed,
            event_links: outcome.links,
            already_synced: false,
        })
    }

    fn job_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 他に待機者がいなければロックエントリを削除する。
    fn release_lock(&self, job_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // マップ + 自分の2参照のみなら誰も待っていない
        if Arc::strong_count(&lock) == 2 {
            locks.remove(job_id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

fn ensure_connected(credential: &CalendarCredential) -> Result<(), AppError> {
    if !credential.connected || credential.access_token.is_empty() {
        return Err(AppError::calendar_not_connected("Calendar is not connected"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::*;
    use crate::domain::error::ErrorCode;
    use crate::domain::extraction::{ExtractionResult, FinalSummary};
    use crate::infra::calendar::CalendarError;
    use crate::infra::storage::NewMeeting;

    /// 投稿回数を数えるモック。タイトルが "fail" のイベントは失敗させる。
    struct CountingProvider {
        posts: AtomicU32,
        refreshes: AtomicU32,
        delay_ms: u64,
    }

    impl CountingProvider {
        fn new(delay_ms: u64) -> Self {
            Self {
                posts: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
                delay_ms,
            }
        }
    }

    #[async_trait]
    impl CalendarProvider for CountingProvider {
        async fn post_event(
            &self,
            credential: &CalendarCredential,
            event: &DatedEvent,
        ) -> Result<String, CalendarError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if event.title == "fail" {
                return Err(CalendarError::RequestFailed("boom".into()));
            }
            let n = self.posts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("https://cal/{}/{n}?token={}", event.title, credential.access_token))
        }

        async fn refresh_credential(
            &self,
            credential: &CalendarCredential,
        ) -> Result<CalendarCredential, CalendarError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(CalendarCredential {
                access_token: "fresh".into(),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                ..credential.clone()
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn event(title: &str) -> DatedEvent {
        DatedEvent {
            id: None,
            title: title.into(),
            date: "2025-12-01".into(),
            formatted_date: "December 1, 2025".into(),
            assignee: "Unassigned".into(),
            description: String::new(),
            urgent: false,
            synced: false,
            completed: false,
            calendar_link: None,
        }
    }

    fn credential(expires_at: Option<chrono::DateTime<Utc>>) -> CalendarCredential {
        CalendarCredential {
            access_token: "old".into(),
            refresh_token: Some("rt".into()),
            expires_at,
            connected: true,
        }
    }

    fn setup(
        titles: &[&str],
        delay_ms: u64,
    ) -> (Arc<Storage>, Arc<CountingProvider>, CalendarReconciler) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let extraction = ExtractionResult {
            final_summary: FinalSummary::default(),
            dated_events: titles.iter().map(|t| event(t)).collect(),
            notes: vec![],
            user_requested_data: None,
        };
        storage
            .save_job_result(&NewMeeting {
                job_id: "j1",
                owner_id: "alice",
                created_at: "2025-01-15T10:30:00Z",
                transcript: "",
                extraction: &extraction,
                user_query: None,
                audio_duration_secs: None,
                processing_secs: 0.0,
            })
            .unwrap();
        let provider = Arc::new(CountingProvider::new(delay_ms));
        let reconciler = CalendarReconciler::new(storage.clone(), provider.clone());
        (storage, provider, reconciler)
    }

    #[tokio::test]
    async fn test_not_connected_is_signaled() {
        let (_, provider, reconciler) = setup(&["a"], 0);
        let err = reconciler.sync_job("j1", "alice").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CalendarNotConnected);
        assert_eq!(provider.posts.load(Ordering::SeqCst), 0);

        let disconnected = CalendarCredential {
            connected: false,
            ..credential(None)
        };
        let err = reconciler.reconcile(&disconnected, &[event("a")]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CalendarNotConnected);
    }

    #[tokio::test]
    async fn test_already_synced_items_are_skipped() {
        let (_, provider, reconciler) = setup(&[], 0);
        let mut done = event("done");
        done.synced = true;
        let outcome = reconciler
            .reconcile(&credential(None), &[done, event("new")])
            .await
            .unwrap();
        assert_eq!(outcome.links.len(), 1);
        assert_eq!(provider.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_job_marks_and_is_idempotent() {
        let (storage, provider, reconciler) = setup(&["a", "b"], 0);
        storage.save_calendar_credential("alice", &credential(None)).unwrap();

        let first = reconciler.sync_job("j1", "alice").await.unwrap();
        assert_eq!(first.posted, 2);
        assert!(!first.already_synced);

        let second = reconciler.sync_job("j1", "alice").await.unwrap();
        assert!(second.already_synced);
        assert!(second.event_links.is_empty());
        assert_eq!(provider.posts.load(Ordering::SeqCst), 2);

        let events = storage.list_dated_events("j1", false).unwrap();
        assert!(events.iter().all(|e| e.synced && e.calendar_link.is_some()));
        assert!(storage.get_meeting_detail("j1").unwrap().unwrap().calendar_synced);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_item_unsynced() {
        let (storage, _, reconciler) = setup(&["ok", "fail"], 0);
        storage.save_calendar_credential("alice", &credential(None)).unwrap();

        let report = reconciler.sync_job("j1", "alice").await.unwrap();
        assert_eq!(report.posted, 1);
        assert_eq!(report.failed, 1);

        let unsynced = storage.list_dated_events("j1", true).unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].title, "fail");
        assert!(!storage.get_meeting_detail("j1").unwrap().unwrap().calendar_synced);
    }

    #[tokio::test]
    async fn test_expired_credential_is_refreshed_and_persisted() {
        let (storage, provider, reconciler) = setup(&["a"], 0);
        let expired = credential(Some(Utc::now() - Duration::minutes(5)));
        storage.save_calendar_credential("alice", &expired).unwrap();

        let report = reconciler.sync_job("j1", "alice").await.unwrap();
        assert!(report.event_links[0].ends_with("token=fresh"));
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);

        let stored = storage.get_calendar_credential("alice").unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_fails() {
        let (_, provider, reconciler) = setup(&[], 0);
        let expired = CalendarCredential {
            refresh_token: None,
            ..credential(Some(Utc::now() - Duration::minutes(5)))
        };
        let err = reconciler.reconcile(&expired, &[event("a")]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Calendar);
        assert_eq!(provider.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sync_posts_each_item_once() {
        let (storage, provider, reconciler) = setup(&["a", "b", "c"], 20);
        storage.save_calendar_credential("alice", &credential(None)).unwrap();
        let reconciler = Arc::new(reconciler);

        let r1 = reconciler.clone();
        let r2 = reconciler.clone();
        let (a, b) = tokio::join!(
            async move { r1.sync_job("j1", "alice").await },
            async move { r2.sync_job("j1", "alice").await },
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(provider.posts.load(Ordering::SeqCst), 3);
        assert_eq!(a.posted + b.posted, 3);
        assert!(a.already_synced || b.already_synced);
        assert_eq!(reconciler.lock_count(), 0);
    }
}
