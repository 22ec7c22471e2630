use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::domain::extraction::{
    DatedEvent, ExtractionResult, FinalSummary, Note, NoteCategory, UserRequestedData,
    DATE_FORMAT, DISPLAY_DATE_FORMAT, SUMMARY_PLACEHOLDER, UNASSIGNED, UNDATED,
};

/// 抽出結果の検証・正規化: 構造修復 → 日付ソート → 表示日付付与
///
/// 入力は信頼できない JSON。どんな入力でも失敗せず、必ず完全な形の結果を返す。
pub struct ExtractionValidator;

impl ExtractionValidator {
    /// 全パイプラインを適用: repair → normalize
    pub fn validate(raw: &Value) -> ExtractionResult {
        let mut result = Self::repair(raw);
        Self::normalize(&mut result);
        result
    }

    /// 構造修復: 欠損キーの補完、非配列の置換、非オブジェクト要素の除去
    pub fn repair(raw: &Value) -> ExtractionResult {
        let empty = Map::new();
        let root = match raw.as_object() {
            Some(obj) => obj,
            None => {
                log::warn!("抽出結果がオブジェクトではありません。空の結果に置換します");
                &empty
            }
        };

        let final_summary = Self::summary_from(
            root.get("final_summary").or_else(|| root.get("key_takeaways")),
        );

        let dated_events = objects_in(root.get("dated_events"), "dated_events")
            .map(Self::event_from)
            .collect();

        let notes = objects_in(root.get("notes"), "notes")
            .map(Self::note_from)
            .collect();

        let user_requested_data = root
            .get("user_requested_data")
            .and_then(Value::as_object)
            .map(|obj| UserRequestedData {
                kind: str_field(obj, &["type"]).map(str::to_string),
                content: str_field(obj, &["content"]).map(str::to_string),
            });

        ExtractionResult {
            final_summary,
            dated_events,
            notes,
            user_requested_data,
        }
    }

    /// 正規化: 日付昇順の安定ソート（未定・不正な日付は末尾）と表示日付の導出
    pub fn normalize(result: &mut ExtractionResult) {
        result
            .dated_events
            .sort_by_key(|e| match e.parsed_date() {
                Some(date) => (0, date),
                None => (1, NaiveDate::MIN),
            });
        for event in &mut result.dated_events {
            event.formatted_date = format_date(&event.date);
        }
    }

    fn summary_from(value: Option<&Value>) -> FinalSummary {
        let Some(obj) = value.and_then(Value::as_object) else {
            if value.is_some() {
                log::warn!("final_summary がオブジェクトではありません");
            }
            return FinalSummary::default();
        };

        let english = match obj.get("english").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => {
                log::warn!("final_summary.english がありません。プレースホルダを設定します");
                SUMMARY_PLACEHOLDER.to_string()
            }
        };

        let translations = obj
            .iter()
            .filter(|(key, _)| key.as_str() != "english")
            .filter_map(|(key, v)| v.as_str().map(|s| (key.clone(), s.to_string())))
            .collect();

        FinalSummary {
            english,
            translations,
        }
    }

    fn event_from(obj: &Map<String, Value>) -> DatedEvent {
        let date = str_field(obj, &["date", "due_date"])
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(UNDATED)
            .to_string();

        DatedEvent {
            id: str_field(obj, &["id"]).map(str::to_string),
            title: text_field(obj, &["title", "task"]),
            formatted_date: date.clone(),
            date,
            assignee: str_field(obj, &["assignee"])
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .unwrap_or(UNASSIGNED)
                .to_string(),
            description: text_field(obj, &["description", "context"]),
            urgent: flag_field(obj, &["urgent", "urgency"]),
            synced: obj.get("synced").and_then(Value::as_bool).unwrap_or(false),
            completed: flag_field(obj, &["completed"]),
            calendar_link: str_field(obj, &["calendar_link"]).map(str::to_string),
        }
    }

    fn note_from(obj: &Map<String, Value>) -> Note {
        Note {
            id: str_field(obj, &["id"]).map(str::to_string),
            category: str_field(obj, &["category", "note_type"])
                .map(NoteCategory::from_label)
                .unwrap_or(NoteCategory::General),
            title: text_field(obj, &["title"]),
            description: text_field(obj, &["description", "details"]),
            urgent: flag_field(obj, &["urgent", "urgency"]),
            manual: flag_field(obj, &["manual"]),
        }
    }
}

/// 機械可読の日付を表示用に整形する。解釈できなければ原文のまま。
pub fn format_date(date: &str) -> String {
    match NaiveDate::parse_from_str(date.trim(), DATE_FORMAT) {
        Ok(d) => d.format(DISPLAY_DATE_FORMAT).to_string(),
        Err(_) => date.to_string(),
    }
}

/// 配列内のオブジェクト要素だけを返す。配列でなければ空。
fn objects_in<'a>(
    value: Option<&'a Value>,
    key: &'static str,
) -> impl Iterator<Item = &'a Map<String, Value>> + 'a {
    let items: &'a [Value] = match value {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Null) | None => &[],
        Some(_) => {
            log::warn!("{key} が配列ではありません。空リストに置換します");
            &[]
        }
    };
    items.iter().enumerate().filter_map(move |(i, item)| match item.as_object() {
        Some(obj) => Some(obj),
        None => {
            log::warn!("{key}[{i}] はオブジェクトではないため除外します");
            None
        }
    })
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> String {
    str_field(obj, keys).unwrap_or_default().to_string()
}

/// bool または "yes"/"true"/"high" 等の文字列を真偽値として読む
fn flag_field(obj: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .map(|v| match v {
            Value::Bool(b) => *b,
            Value::String(s) => matches!(
                s.trim().to_lowercase().as_str(),
                "yes" | "true" | "high" | "urgent" | "1"
            ),
            _ => false,
        })
        .unwrap_or(false)
}
