use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::AppError;
use crate::domain::extraction::{DatedEvent, FinalSummary, Note, UserRequestedData};
use crate::domain::progress;

/// パイプラインのステージ。宣言順が実行順。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Vad,
    Enhancement,
    Transcription,
    Diarization,
    Extraction,
    Calendar,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::Vad,
        StageName::Enhancement,
        StageName::Transcription,
        StageName::Diarization,
        StageName::Extraction,
        StageName::Calendar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Vad => "vad",
            StageName::Enhancement => "enhancement",
            StageName::Transcription => "transcription",
            StageName::Diarization => "diarization",
            StageName::Extraction => "extraction",
            StageName::Calendar => "calendar",
        }
    }

    /// エラーメッセージ用の表示名
    pub fn label(&self) -> &'static str {
        match self {
            StageName::Vad => "Voice activity detection",
            StageName::Enhancement => "Enhancement",
            StageName::Transcription => "Transcription",
            StageName::Diarization => "Diarization",
            StageName::Extraction => "Extraction",
            StageName::Calendar => "Calendar",
        }
    }

    pub fn next(&self) -> Option<StageName> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

/// ステージ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    /// 0..=100
    pub progress: u8,
    /// 完了/失敗時のみ
    pub duration_ms: Option<u64>,
    /// 失敗時のみ
    pub error: Option<String>,
}

impl StageState {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            progress: 0,
            duration_ms: None,
            error: None,
        }
    }
}

/// ジョブ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

/// 出力項目の選択（未指定はすべて有効）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFields {
    pub transcript: bool,
    pub summary_english: bool,
    pub summary_arabic: bool,
    pub action_items: bool,
    pub deadlines: bool,
    pub budget_notes: bool,
    pub decisions: bool,
    pub general_notes: bool,
    pub calendar_sync: bool,
}

impl Default for OutputFields {
    fn default() -> Self {
        Self {
            transcript: true,
            summary_english: true,
            summary_arabic: true,
            action_items: true,
            deadlines: true,
            budget_notes: true,
            decisions: true,
            general_notes: true,
            calendar_sync: true,
        }
    }
}

/// ジョブ単位の処理設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// 参加者の役割（抽出プロンプトの観点）
    pub role: Option<String>,
    pub output_fields: OutputFields,
    /// 会議に対するユーザーの質問
    pub user_query: Option<String>,
    /// 質問への回答だけを求めるモード
    pub custom_field_only: bool,
}

/// 完了ジョブの最終成果物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub transcript: String,
    pub final_summary: FinalSummary,
    pub dated_events: Vec<DatedEvent>,
    pub notes: Vec<Note>,
    pub user_requested_data: Option<UserRequestedData>,
    pub calendar_event_links: Vec<String>,
    pub audio_duration_secs: Option<f64>,
    pub processing_secs: f64,
}

/// ポーリング応答
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub overall_progress: u8,
    pub current_stage: Option<StageName>,
    pub stages: BTreeMap<StageName, StageState>,
    pub error: Option<String>,
}

/// ジョブレコード
///
/// 書き込みはジョブ自身のタスクのみ（`JobRegistry::update` 経由）。
/// `overall_progress` はステージ変更のたびに再計算され、外部から設定できない。
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub owner_id: String,
    pub created_at: String,
    status: JobStatus,
    overall_progress: u8,
    stages: BTreeMap<StageName, StageState>,
    result: Option<JobResult>,
    error: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: String, owner_id: String, now: String) -> Self {
        let stages = StageName::ALL
            .iter()
            .map(|s| (*s, StageState::pending()))
            .collect();
        Self {
            job_id,
            owner_id,
            created_at: now,
            status: JobStatus::Processing,
            overall_progress: 0,
            stages,
            result: None,
            error: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn overall_progress(&self) -> u8 {
        self.overall_progress
    }

    pub fn stages(&self) -> &BTreeMap<StageName, StageState> {
        &self.stages
    }

    pub fn stage(&self, name: StageName) -> &StageState {
        // new() で全ステージを挿入済み
        &self.stages[&name]
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// 実行中のステージ
    pub fn current_stage(&self) -> Option<StageName> {
        self.stages
            .iter()
            .find(|(_, s)| s.status == StageStatus::InProgress)
            .map(|(name, _)| *name)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id.clone(),
            status: self.status,
            overall_progress: self.overall_progress,
            current_stage: self.current_stage(),
            stages: self.stages.clone(),
            error: self.error.clone(),
        }
    }

    // ─── 状態遷移 ───────────────────────────────────────────

    /// 最初のステージを開始する。
    pub fn start(&mut self) -> Result<(), AppError> {
        self.ensure_processing()?;
        let first = StageName::ALL[0];
        if self.stage(first).status != StageStatus::Pending {
            return Err(AppError::invalid_state("ジョブは既に開始されています"));
        }
        self.begin(first);
        self.recompute();
        Ok(())
    }

    /// 実行中ステージの進捗を更新する（単調増加）。
    pub fn report_progress(&mut self, stage: StageName, progress: u8) -> Result<(), AppError> {
        self.ensure_in_progress(stage)?;
        if let Some(state) = self.stages.get_mut(&stage) {
            state.progress = state.progress.max(progress.min(100));
        }
        self.recompute();
        Ok(())
    }

    /// ステージを完了し、次のステージを開始する（1回の更新で遷移）。
    pub fn advance(&mut self, stage: StageName, duration_ms: u64) -> Result<(), AppError> {
        self.ensure_in_progress(stage)?;
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::Complete;
            state.progress = 100;
            state.duration_ms = Some(duration_ms);
        }
        if let Some(next) = stage.next() {
            self.begin(next);
        }
        self.recompute();
        Ok(())
    }

    /// 全ステージ完了後に結果を確定する。
    pub fn complete(&mut self, result: JobResult) -> Result<(), AppError> {
        self.ensure_processing()?;
        if let Some((name, _)) = self
            .stages
            .iter()
            .find(|(_, s)| s.status != StageStatus::Complete)
        {
            return Err(AppError::invalid_state(format!(
                "未完了のステージがあります: {}",
                name.as_str()
            )));
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.recompute();
        Ok(())
    }

    /// ステージを失敗させ、ジョブを終了する。後続ステージは pending のまま。
    pub fn fail(
        &mut self,
        stage: StageName,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Result<(), AppError> {
        self.ensure_in_progress(stage)?;
        let message = message.into();
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::Failed;
            state.progress = 0;
            state.duration_ms = Some(duration_ms);
            state.error = Some(message.clone());
        }
        self.status = JobStatus::Failed;
        self.error = Some(format!("{} failed: {}", stage.label(), message));
        self.recompute();
        Ok(())
    }

    fn begin(&mut self, stage: StageName) {
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::InProgress;
            state.progress = 0;
        }
    }

    fn ensure_processing(&self) -> Result<(), AppError> {
        if self.status != JobStatus::Processing {
            return Err(AppError::invalid_state(format!(
                "ジョブは終了済みです: {:?}",
                self.status
            )));
        }
        Ok(())
    }

    fn ensure_in_progress(&self, stage: StageName) -> Result<(), AppError> {
        self.ensure_processing()?;
        if self.stage(stage).status != StageStatus::InProgress {
            return Err(AppError::invalid_state(format!(
                "ステージが実行中ではありません: {}",
                stage.as_str()
            )));
        }
        Ok(())
    }

    fn recompute(&mut self) {
        self.overall_progress = progress::overall_progress(&self.stages);
    }
}
