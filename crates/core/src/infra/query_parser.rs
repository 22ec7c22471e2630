use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::domain::extraction::{
    DatedEvent, Note, NoteCategory, UserRequestedData, DATE_FORMAT, UNASSIGNED,
};

/// タイトルの最大文字数
const MAX_TITLE_CHARS: usize = 100;

/// 質問回答の解析結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQueryResult {
    pub dated_events: Vec<DatedEvent>,
    pub notes: Vec<Note>,
}

/// 質問回答（自由文）から日付と金額を拾い、イベントとメモを組み立てる。
/// 「質問のみ」モードで標準抽出の代わりに使う。
pub struct QueryResultParser;

impl QueryResultParser {
    pub fn parse(data: &UserRequestedData) -> ParsedQueryResult {
        let Some(content) = data.content.as_deref().map(str::trim).filter(|c| !c.is_empty())
        else {
            return ParsedQueryResult::default();
        };

        let dated_events: Vec<DatedEvent> = Self::find_dates(content)
            .into_iter()
            .map(|(date, sentence)| DatedEvent {
                id: None,
                title: truncate_title(&sentence),
                date: date.format(DATE_FORMAT).to_string(),
                formatted_date: String::new(),
                assignee: UNASSIGNED.to_string(),
                description: format!("From query: {sentence}"),
                urgent: false,
                synced: false,
                completed: false,
                calendar_link: None,
            })
            .collect();

        let note = if Self::mentions_money(content) {
            log::info!("質問回答に金額/予算の記述を検出しました");
            Note {
                id: None,
                category: NoteCategory::Budget,
                title: "Budget Information (Additional Analysis)".to_string(),
                description: content.to_string(),
                urgent: false,
                manual: false,
            }
        } else {
            Note {
                id: None,
                category: NoteCategory::General,
                title: "Additional Analysis".to_string(),
                description: content.to_string(),
                urgent: false,
                manual: false,
            }
        };

        log::info!(
            "質問回答から {} 件のイベントと 1 件のメモを抽出しました",
            dated_events.len()
        );

        ParsedQueryResult {
            dated_events,
            notes: vec![note],
        }
    }

    /// 文中の日付を出現順に返す。各日付はそれを含む文と組にする。
    fn find_dates(content: &str) -> Vec<(NaiveDate, String)> {
        let mut spans: Vec<(usize, usize, NaiveDate)> = Vec::new();

        for re in date_patterns() {
            for m in re.find_iter(content) {
                if spans.iter().any(|(s, e, _)| m.start() < *e && *s < m.end()) {
                    continue;
                }
                match parse_date(m.as_str()) {
                    Some(date) => spans.push((m.start(), m.end(), date)),
                    None => log::warn!("日付として解釈できません: {}", m.as_str()),
                }
            }
        }

        spans.sort_by_key(|(start, _, _)| *start);
        spans
            .into_iter()
            .map(|(start, end, date)| (date, sentence_around(content, start, end)))
            .collect()
    }

    fn mentions_money(content: &str) -> bool {
        money_patterns().iter().any(|re| re.is_match(content))
    }
}

const MONTHS: &str = "Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|Jun(?:e)?|Jul(?:y)?|\
Aug(?:ust)?|Sep(?:t(?:ember)?)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?";

fn date_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\b\d{4}-\d{1,2}-\d{1,2}\b".to_string(),
            r"\b\d{1,2}[/-]\d{1,2}[/-]\d{4}\b".to_string(),
            format!(r"(?i)\b(?:{MONTHS})\.?\s+\d{{1,2}}(?:st|nd|rd|th)?,?\s+\d{{4}}\b"),
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn money_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\$\s*\d+(?:,\d{3})*(?:\.\d{2})?",
            r"(?i)\d+(?:,\d{3})*(?:\.\d{2})?\s*(?:dollars?|usd)\b",
            r"(?i)\b(?:budget|cost|expense|price|fund(?:ing)?|spend(?:ing)?|allocat(?:e|ion))",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 一致文字列を日付に変換する
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let numeric_formats = ["%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y"];
    if let Some(d) = numeric_formats
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
    {
        return Some(d);
    }

    // "March 4th 2025" → "March 4, 2025"
    let cleaned: String = raw
        .replace(['.', ','], " ")
        .split_whitespace()
        .map(|token| {
            let lower = token.to_lowercase();
            let digits = lower.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                digits.to_string()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    ["%B %d %Y", "%b %d %Y"]
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(&cleaned, f).ok())
}

/// 一致位置を含む文（. ! ? 改行で区切る）
fn sentence_around(content: &str, start: usize, end: usize) -> String {
    let is_break = |c: char| matches!(c, '.' | '!' | '?' | '\n');
    let begin = content[..start]
        .char_indices()
        .rev()
        .find(|(i, c)| is_break(*c) && !is_decimal_point(content, *i))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let finish = content[end..]
        .char_indices()
        .find(|(i, c)| is_break(*c) && !is_decimal_point(content, end + *i))
        .map(|(i, _)| end + i)
        .unwrap_or(content.len());
    content[begin..finish].trim().to_string()
}

/// "1,500.00" のような数値中の "." は文の区切りではない
fn is_decimal_point(content: &str, idx: usize) -> bool {
    let before = content[..idx].chars().next_back();
    let after = content[idx + 1..].chars().next();
    content.as_bytes().get(idx) == Some(&b'.')
        && before.is_some_and(|c| c.is_ascii_digit())
        && after.is_some_and(|c| c.is_ascii_digit())
}

fn truncate_title(sentence: &str) -> String {
    if sentence.chars().count() > MAX_TITLE_CHARS {
        let head: String = sentence.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{head}...")
    } else {
        sentence.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(content: &str) -> UserRequestedData {
        UserRequestedData {
            kind: Some("list".into()),
            content: Some(content.into()),
        }
    }

    #[test]
    fn empty_content_yields_nothing() {
        let parsed = QueryResultParser::parse(&UserRequestedData {
            kind: None,
            content: None,
        });
        assert_eq!(parsed, ParsedQueryResult::default());
    }

    #[test]
    fn finds_dates_in_several_formats() {
        let parsed = QueryResultParser::parse(&data(
            "Budget proposal submission: November 28, 2025 - final review. \
             Launch on 2025-12-01. Retro 12/15/2025!",
        ));
        let dates: Vec<_> = parsed.dated_events.iter().map(|e| e.date.as_str()).collect();
        assert_eq!(dates, vec!["2025-11-28", "2025-12-01", "2025-12-15"]);
        assert_eq!(parsed.dated_events[1].title, "Launch on 2025-12-01");
        assert_eq!(
            parsed.dated_events[1].description,
            "From query: Launch on 2025-12-01"
        );
        assert_eq!(parsed.dated_events[0].assignee, UNASSIGNED);
    }

    #[test]
    fn abbreviated_month_with_ordinal() {
        let parsed = QueryResultParser::parse(&data("Kickoff is Jan 5th 2026"));
        assert_eq!(parsed.dated_events[0].date, "2026-01-05");
    }

    #[test]
    fn day_first_dash_format() {
        let parsed = QueryResultParser::parse(&data("Audit due 31-01-2026"));
        assert_eq!(parsed.dated_events[0].date, "2026-01-31");
    }

    #[test]
    fn invalid_calendar_date_is_skipped() {
        let parsed = QueryResultParser::parse(&data("Due 2025-02-30 maybe"));
        assert!(parsed.dated_events.is_empty());
    }

    #[test]
    fn money_creates_budget_note() {
        let parsed = QueryResultParser::parse(&data("Shortfall: $15,000.50 for ads"));
        assert_eq!(parsed.notes.len(), 1);
        assert_eq!(parsed.notes[0].category, NoteCategory::Budget);
        assert_eq!(parsed.notes[0].description, "Shortfall: $15,000.50 for ads");
    }

    #[test]
    fn plain_answer_creates_general_note() {
        let parsed = QueryResultParser::parse(&data("Sarah and John attended."));
        assert_eq!(parsed.notes[0].category, NoteCategory::General);
        assert_eq!(parsed.notes[0].title, "Additional Analysis");
        assert!(parsed.dated_events.is_empty());
    }

    #[test]
    fn long_sentence_title_is_truncated() {
        let sentence = format!("{} 2025-01-01", "word ".repeat(40));
        let parsed = QueryResultParser::parse(&data(&sentence));
        let title = &parsed.dated_events[0].title;
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with("..."));
    }
}
