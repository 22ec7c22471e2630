use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 日付未定を表す番兵値
pub const UNDATED: &str = "TBD";
/// 担当者未定
pub const UNASSIGNED: &str = "Unassigned";
/// 要約が得られなかった場合のプレースホルダ
pub const SUMMARY_PLACEHOLDER: &str = "Summary not available";

/// 機械可読な日付フォーマット
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// 表示用日付フォーマット（例: "December 1, 2025"）
pub const DISPLAY_DATE_FORMAT: &str = "%B %-d, %Y";

/// 会議要約。`english` は必須、その他の言語はキー付きで保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub english: String,
    #[serde(flatten)]
    pub translations: BTreeMap<String, String>,
}

impl Default for FinalSummary {
    fn default() -> Self {
        Self {
            english: SUMMARY_PLACEHOLDER.to_string(),
            translations: BTreeMap::new(),
        }
    }
}

/// 日付付きアクションアイテム（カレンダー同期対象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedEvent {
    /// 永続化後に付与される ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    /// `YYYY-MM-DD` または [`UNDATED`]
    pub date: String,
    /// 表示専用。`date` から導出される。
    pub formatted_date: String,
    pub assignee: String,
    pub description: String,
    pub urgent: bool,
    pub synced: bool,
    pub calendar_link: Option<String>,
    /// タスクの完了チェック（カレンダー同期とは独立）
    #[serde(default)]
    pub completed: bool,
}

impl DatedEvent {
    /// `date` を解釈する。未定・不正な値は `None`。
    pub fn parsed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date.trim(), DATE_FORMAT).ok()
    }

    pub fn is_undated(&self) -> bool {
        self.parsed_date().is_none()
    }
}

/// メモ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteCategory {
    #[serde(rename = "BUDGET")]
    Budget,
    #[serde(rename = "DECISION")]
    Decision,
    #[serde(rename = "GENERAL")]
    General,
}

impl NoteCategory {
    /// 自由形式のラベルから種別を推定する（"BUDGET_NOTE" 等も受け付ける）。
    pub fn from_label(label: &str) -> Self {
        let upper = label.trim().to_uppercase();
        if upper.contains("BUDGET") {
            NoteCategory::Budget
        } else if upper.contains("DECISION") {
            NoteCategory::Decision
        } else {
            NoteCategory::General
        }
    }

    /// 厳密な種別名（大文字小文字は区別しない）。手動入力の検証に使う。
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_uppercase().as_str() {
            "BUDGET" => Some(NoteCategory::Budget),
            "DECISION" => Some(NoteCategory::Decision),
            "GENERAL" => Some(NoteCategory::General),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteCategory::Budget => "BUDGET",
            NoteCategory::Decision => "DECISION",
            NoteCategory::General => "GENERAL",
        }
    }
}

/// 日付を持たないメモ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub category: NoteCategory,
    pub title: String,
    pub description: String,
    pub urgent: bool,
    /// ユーザーが手動で追加したメモ
    #[serde(default)]
    pub manual: bool,
}

/// ユーザー質問への回答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRequestedData {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub content: Option<String>,
}

/// 検証・正規化済みの抽出結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub final_summary: FinalSummary,
    pub dated_events: Vec<DatedEvent>,
    pub notes: Vec<Note>,
    pub user_requested_data: Option<UserRequestedData>,
}

impl ExtractionResult {
    /// 新規抽出結果の同期状態を初期化する。
    /// 抽出器が `synced` を返しても、未投稿のアイテムは未同期として扱う。
    pub fn reset_sync_state(&mut self) {
        for event in &mut self.dated_events {
            event.id = None;
            event.synced = false;
            event.calendar_link = None;
        }
        for note in &mut self.notes {
            note.id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(date: &str) -> DatedEvent {
        DatedEvent {
            id: None,
            title: "Send report".into(),
            date: date.into(),
            formatted_date: date.into(),
            assignee: UNASSIGNED.into(),
            description: String::new(),
            urgent: false,
            synced: false,
            completed: false,
            calendar_link: None,
        }
    }

    #[test]
    fn parsed_date_accepts_iso_only() {
        assert_eq!(
            event("2025-12-01").parsed_date(),
            NaiveDate::from_ymd_opt(2025, 12, 1)
        );
        assert!(event(UNDATED).is_undated());
        assert!(event("12/01/2025").is_undated());
    }

    #[test]
    fn note_category_from_label() {
        assert_eq!(NoteCategory::from_label("budget_note"), NoteCategory::Budget);
        assert_eq!(NoteCategory::from_label("DECISION"), NoteCategory::Decision);
        assert_eq!(NoteCategory::from_label("GENERAL_NOTE"), NoteCategory::General);
        assert_eq!(NoteCategory::from_label("random"), NoteCategory::General);
    }

    #[test]
    fn note_category_parse_is_strict() {
        assert_eq!(NoteCategory::parse(" decision "), Some(NoteCategory::Decision));
        assert_eq!(NoteCategory::parse("BUDGET_NOTE"), None);
        assert_eq!(NoteCategory::parse(""), None);
    }

    #[test]
    fn summary_translations_flatten() {
        let mut summary = FinalSummary {
            english: "We agreed.".into(),
            translations: BTreeMap::new(),
        };
        summary.translations.insert("arabic".into(), "اتفقنا".into());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["english"], "We agreed.");
        assert_eq!(json["arabic"], "اتفقنا");
    }

    #[test]
    fn reset_sync_state_clears_links() {
        let mut synced = event("2025-12-01");
        synced.synced = true;
        synced.calendar_link = Some("https://calendar/1".into());
        let mut result = ExtractionResult {
            final_summary: FinalSummary::default(),
            dated_events: vec![synced],
            notes: vec![],
            user_requested_data: None,
        };
        result.reset_sync_state();
        assert!(!result.dated_events[0].synced);
        assert!(result.dated_events[0].calendar_link.is_none());
    }
}
