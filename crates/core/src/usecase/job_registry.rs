use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::error::AppError;
use crate::domain::job::{JobRecord, JobStatus};

/// ジョブレジストリ: job_id をキーにした JobRecord の共有ストア。
///
/// - 書き込みはジョブ自身のタスクが `update` で行う（1ジョブ1ライター）。
/// - 読み取りはスナップショット（clone）を返すため、途中状態を観測しない。
/// - ロックは同期処理の間だけ保持し、`.await` を跨がない。
/// - プロセス再起動で消える。終了済みレコードは `cleanup_finished` まで残る。
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// 新しいジョブを登録する。同じ job_id が存在する場合はエラー。
    pub fn insert(&self, record: JobRecord) -> Result<(), AppError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&record.job_id) {
            return Err(AppError::invalid_state(format!(
                "ジョブは登録済みです: {}",
                record.job_id
            )));
        }
        jobs.insert(record.job_id.clone(), record);
        Ok(())
    }

    /// ジョブのスナップショットを取得
    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().get(job_id).cloned()
    }

    /// レコードを書き込みロック下で更新する。
    ///
    /// クロージャがエラーを返した場合、それまでの変更は破棄される。
    pub fn update<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::not_found(format!("ジョブが見つかりません: {job_id}")))?;

        let mut draft = entry.clone();
        let out = f(&mut draft)?;
        *entry = draft;
        Ok(out)
    }

    pub fn remove(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.write().remove(job_id)
    }

    /// 終了済み（completed / failed）のジョブを削除し、削除件数を返す。
    pub fn cleanup_finished(&self) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, record| record.status() == JobStatus::Processing);
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::error::ErrorCode;
    use crate::domain::job::{StageName, StageStatus};

    fn record(job_id: &str) -> JobRecord {
        JobRecord::new(job_id.into(), "owner".into(), "2025-01-15T10:30:00Z".into())
    }

    #[test]
    fn test_insert_and_get() {
        let registry = JobRegistry::new();
        registry.insert(record("j1")).unwrap();

        let snapshot = registry.get("j1").unwrap();
        assert_eq!(snapshot.owner_id, "owner");
        assert_eq!(snapshot.status(), JobStatus::Processing);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = JobRegistry::new();
        registry.insert(record("j1")).unwrap();
        let err = registry.insert(record("j1")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
    }

    #[test]
    fn test_update_applies_transition() {
        let registry = JobRegistry::new();
        registry.insert(record("j1")).unwrap();

        registry.update("j1", |r| r.start()).unwrap();
        registry.update("j1", |r| r.advance(StageName::Vad, 4)).unwrap();

        let snapshot = registry.get("j1").unwrap();
        assert_eq!(snapshot.stage(StageName::Vad).status, StageStatus::Complete);
        assert_eq!(snapshot.current_stage(), Some(StageName::Enhancement));
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let registry = JobRegistry::new();
        registry.insert(record("j1")).unwrap();
        registry.update("j1", |r| r.start()).unwrap();

        let err = registry
            .update("j1", |r| {
                r.advance(StageName::Vad, 1)?;
                // Enhancement が実行中なので Transcription は完了できない
                r.advance(StageName::Transcription, 1)
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
        assert_eq!(registry.get("j1").unwrap().current_stage(), Some(StageName::Vad));
    }

    #[test]
    fn test_update_missing_job() {
        let registry = JobRegistry::new();
        let err = registry.update("nope", |r| r.start()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_cleanup_finished() {
        let registry = JobRegistry::new();
        registry.insert(record("done")).unwrap();
        registry.insert(record("running")).unwrap();
        registry
            .update("done", |r| {
                r.start()?;
                r.fail(StageName::Vad, "missing input", 1)
            })
            .unwrap();

        assert_eq!(registry.cleanup_finished(), 1);
        assert!(registry.get("done").is_none());
        assert!(registry.get("running").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_and_reads() {
        let registry = Arc::new(JobRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("j{i}");
                registry.insert(record(&id)).unwrap();
                registry.update(&id, |r| r.start()).unwrap();
                registry.get(&id).unwrap().current_stage()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some(StageName::Vad));
        }
        assert_eq!(registry.len(), 32);
    }
}
