use serde::{Deserialize, Serialize};

use crate::domain::extraction::{DatedEvent, FinalSummary, Note, UserRequestedData};
use crate::domain::job::ProcessingConfig;

/// 会議サマリー（履歴一覧用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingSummary {
    pub job_id: String,
    pub created_at: String,
    /// 要約の英語本文
    pub summary_english: String,
    pub event_count: u32,
    pub note_count: u32,
    pub calendar_synced: bool,
}

/// 会議詳細（アイテム付き）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingDetail {
    pub job_id: String,
    pub owner_id: String,
    pub created_at: String,
    pub transcript: String,
    pub final_summary: FinalSummary,
    pub dated_events: Vec<DatedEvent>,
    pub notes: Vec<Note>,
    pub user_query: Option<String>,
    pub user_requested_data: Option<UserRequestedData>,
    pub calendar_synced: bool,
    pub audio_duration_secs: Option<f64>,
    pub processing_secs: Option<f64>,
}

/// 履歴ページ（カーソルベースページネーション）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub items: Vec<MeetingSummary>,
    pub next_cursor: Option<String>,
}

/// 処理設定のプリセット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: Option<String>,
    pub owner_id: String,
    pub name: String,
    pub config: ProcessingConfig,
    pub is_default: bool,
}

/// 会議に属するアイテムの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    DatedEvent,
    Note,
}

/// アイテムの所属（権限確認用）
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOwner {
    pub job_id: String,
    pub owner_id: String,
    pub kind: ItemKind,
}

/// 月別の会議数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCount {
    /// `YYYY-MM`
    pub month: String,
    pub count: u32,
}

/// オーナー単位の集計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingAnalytics {
    pub total_meetings: u32,
    pub total_events: u32,
    pub total_notes: u32,
    /// 長さが分かる会議のみで平均
    pub avg_duration_secs: f64,
    pub total_audio_duration_secs: f64,
    pub meetings_with_audio_duration: u32,
    pub avg_processing_secs: f64,
    pub meetings_last_30_days: u32,
    pub calendar_synced_meetings: u32,
    pub calendar_connected: bool,
    /// 直近12か月（古い順、会議がない月は 0）
    pub meetings_by_month: Vec<MonthlyCount>,
}
