use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::calendar::CalendarCredential;
use crate::domain::error::AppError;
use crate::domain::extraction::{
    DatedEvent, ExtractionResult, FinalSummary, Note, UserRequestedData,
};
use crate::domain::settings::PipelineSettings;
use crate::domain::types::{
    HistoryPage, ItemKind, ItemOwner, MeetingAnalytics, MeetingDetail, MeetingSummary,
    MonthlyCount, Preset,
};

const ITEM_DATED_EVENT: &str = "dated_event";
const ITEM_NOTE: &str = "note";
/// 「最近の会議」とみなす日数
const RECENT_DAYS: i64 = 30;
const MONTHS_IN_CHART: u32 = 12;

/// 保存する会議結果
#[derive(Debug, Clone)]
pub struct NewMeeting<'a> {
    pub job_id: &'a str,
    pub owner_id: &'a str,
    pub created_at: &'a str,
    pub transcript: &'a str,
    pub extraction: &'a ExtractionResult,
    pub user_query: Option<&'a str>,
    pub audio_duration_secs: Option<f64>,
    pub processing_secs: f64,
}

/// SQLiteストレージ（meetings + items + credentials + presets + settings）
///
/// 接続は1本を Mutex で共有する。ロックを `.await` 越しに保持しないこと。
pub struct Storage {
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::storage(format!("{context}: {e}"))
}

impl Storage {
    /// 新規接続（ファイルパス指定）
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path).map_err(db_err("DB接続に失敗"))?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory().map_err(db_err("in-memory DB作成に失敗"))?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    /// スキーママイグレーション
    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS meetings (
                    job_id              TEXT PRIMARY KEY,
                    owner_id            TEXT NOT NULL,
                    created_at          TEXT NOT NULL,
                    transcript          TEXT NOT NULL DEFAULT '',
                    summary_json        TEXT NOT NULL,
                    user_query          TEXT,
                    user_requested_json TEXT,
                    calendar_synced     INTEGER NOT NULL DEFAULT 0,
                    audio_duration_secs REAL,
                    processing_secs     REAL
                );

                CREATE INDEX IF NOT EXISTS idx_meetings_owner_created
                    ON meetings(owner_id, created_at DESC);

                CREATE TABLE IF NOT EXISTS items (
                    item_id       TEXT PRIMARY KEY,
                    job_id        TEXT NOT NULL,
                    item_type     TEXT NOT NULL,
                    position      INTEGER NOT NULL,
                    data_json     TEXT NOT NULL,
                    synced        INTEGER NOT NULL DEFAULT 0,
                    calendar_link TEXT,
                    FOREIGN KEY (job_id) REFERENCES meetings(job_id)
                );

                CREATE INDEX IF NOT EXISTS idx_items_job_type
                    ON items(job_id, item_type);

                CREATE TABLE IF NOT EXISTS calendar_credentials (
                    owner_id      TEXT PRIMARY KEY,
                    access_token  TEXT NOT NULL,
                    refresh_token TEXT,
                    expires_at    TEXT,
                    connected     INTEGER NOT NULL DEFAULT 1,
                    updated_at    TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS presets (
                    id          TEXT PRIMARY KEY,
                    owner_id    TEXT NOT NULL,
                    name        TEXT NOT NULL,
                    config_json TEXT NOT NULL,
                    is_default  INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_presets_owner
                    ON presets(owner_id);

                CREATE TABLE IF NOT EXISTS settings (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(db_err("マイグレーション失敗"))?;
        Ok(())
    }

    // --- Meetings ---

    /// 会議結果とアイテムを1トランザクションで保存する。
    ///
    /// 同じ job_id が既に保存済みなら何もせず `false` を返す。
    pub fn save_job_result(&self, meeting: &NewMeeting<'_>) -> Result<bool, AppError> {
        let summary_json = to_json(&meeting.extraction.final_summary)?;
        let requested_json = meeting
            .extraction
            .user_requested_data
            .as_ref()
            .map(to_json)
            .transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("トランザクション開始失敗"))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO meetings
                    (job_id, owner_id, created_at, transcript, summary_json, user_query,
                     user_requested_json, audio_duration_secs, processing_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    meeting.job_id,
                    meeting.owner_id,
                    meeting.created_at,
                    meeting.transcript,
                    summary_json,
                    meeting.user_query,
                    requested_json,
                    meeting.audio_duration_secs,
                    meeting.processing_secs,
                ],
            )
            .map_err(db_err("会議保存失敗"))?;

        if inserted == 0 {
            log::warn!("会議 {} は保存済みのため再保存しません", meeting.job_id);
            return Ok(false);
        }

        for (position, event) in meeting.extraction.dated_events.iter().enumerate() {
            tx.execute(
                "INSERT INTO items (item_id, job_id, item_type, position, data_json, synced, calendar_link)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new_item_id(),
                    meeting.job_id,
                    ITEM_DATED_EVENT,
                    position as i64,
                    to_json(event)?,
                    event.synced as i32,
                    event.calendar_link,
                ],
            )
            .map_err(db_err("イベント保存失敗"))?;
        }
        for (position, note) in meeting.extraction.notes.iter().enumerate() {
            tx.execute(
                "INSERT INTO items (item_id, job_id, item_type, position, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new_item_id(),
                    meeting.job_id,
                    ITEM_NOTE,
                    position as i64,
                    to_json(note)?,
                ],
            )
            .map_err(db_err("メモ保存失敗"))?;
        }

        tx.commit().map_err(db_err("コミット失敗"))?;
        log::info!(
            "会議 {} を保存しました (events={}, notes={})",
            meeting.job_id,
            meeting.extraction.dated_events.len(),
            meeting.extraction.notes.len()
        );
        Ok(true)
    }

    pub fn get_meeting_owner(&self, job_id: &str) -> Result<Option<String>, AppError> {
        self.conn
            .lock()
            .query_row(
                "SELECT owner_id FROM meetings WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))
    }

    pub fn get_meeting_detail(&self, job_id: &str) -> Result<Option<MeetingDetail>, AppError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT job_id, owner_id, created_at, transcript, summary_json, user_query,
                        user_requested_json, calendar_synced, audio_duration_secs, processing_secs
                 FROM meetings WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i32>(7)?,
                        row.get::<_, Option<f64>>(8)?,
                        row.get::<_, Option<f64>>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?;

        let Some((
            job_id,
            owner_id,
            created_at,
            transcript,
            summary_json,
            user_query,
            requested_json,
            calendar_synced,
            audio_duration_secs,
            processing_secs,
        )) = row
        else {
            return Ok(None);
        };

        let final_summary: FinalSummary = from_json_or_default(&summary_json);
        let user_requested_data: Option<UserRequestedData> = requested_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());

        Ok(Some(MeetingDetail {
            dated_events: self.list_dated_events(&job_id, false)?,
            notes: self.list_notes(&job_id)?,
            job_id,
            owner_id,
            created_at,
            transcript,
            final_summary,
            user_query,
            user_requested_data,
            calendar_synced: calendar_synced != 0,
            audio_duration_secs,
            processing_secs,
        }))
    }

    /// オーナーの会議一覧（新しい順、created_at カーソル）
    pub fn list_meetings(
        &self,
        owner_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT m.job_id, m.created_at, m.summary_json, m.calendar_synced,
                        (SELECT COUNT(*) FROM items i WHERE i.job_id = m.job_id AND i.item_type = 'dated_event'),
                        (SELECT COUNT(*) FROM items i WHERE i.job_id = m.job_id AND i.item_type = 'note')
                 FROM meetings m
                 WHERE m.owner_id = ?1 AND (?2 IS NULL OR m.created_at < ?2)
                 ORDER BY m.created_at DESC
                 LIMIT ?3",
            )
            .map_err(db_err("クエリ準備失敗"))?;

        let rows: Vec<MeetingSummary> = stmt
            .query_map(params![owner_id, cursor, limit + 1], |row| {
                let summary_json: String = row.get(2)?;
                let synced: i32 = row.get(3)?;
                Ok(MeetingSummary {
                    job_id: row.get(0)?,
                    created_at: row.get(1)?,
                    summary_english: from_json_or_default::<FinalSummary>(&summary_json).english,
                    event_count: row.get(4)?,
                    note_count: row.get(5)?,
                    calendar_synced: synced != 0,
                })
            })
            .map_err(db_err("クエリ実行失敗"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("行読み取り失敗"))?;

        let has_next = rows.len() > limit as usize;
        let items: Vec<MeetingSummary> = rows.into_iter().take(limit as usize).collect();
        let next_cursor = if has_next {
            items.last().map(|m| m.created_at.clone())
        } else {
            None
        };

        Ok(HistoryPage { items, next_cursor })
    }

    pub fn delete_meeting(&self, job_id: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("トランザクション開始失敗"))?;
        tx.execute("DELETE FROM items WHERE job_id = ?1", params![job_id])
            .map_err(db_err("アイテム削除失敗"))?;
        let affected = tx
            .execute("DELETE FROM meetings WHERE job_id = ?1", params![job_id])
            .map_err(db_err("会議削除失敗"))?;
        tx.commit().map_err(db_err("コミット失敗"))?;
        Ok(affected > 0)
    }

    // --- Items ---

    /// 会議の日付付きイベント（保存順）
    pub fn list_dated_events(
        &self,
        job_id: &str,
        unsynced_only: bool,
    ) -> Result<Vec<DatedEvent>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT item_id, data_json, synced, calendar_link FROM items
                 WHERE job_id = ?1 AND item_type = 'dated_event' AND (?2 = 0 OR synced = 0)
                 ORDER BY position",
            )
            .map_err(db_err("クエリ準備失敗"))?;

        let rows = stmt
            .query_map(params![job_id, unsynced_only as i32], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(db_err("クエリ実行失敗"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("行読み取り失敗"))?;

        let mut events = Vec::with_capacity(rows.len());
        for (item_id, data_json, synced, link) in rows {
            let mut event: DatedEvent = serde_json::from_str(&data_json)
                .map_err(|e| AppError::storage(format!("イベント復元失敗 ({item_id}): {e}")))?;
            // 同期状態は専用カラムが正
            event.id = Some(item_id);
            event.synced = synced != 0;
            event.calendar_link = link;
            events.push(event);
        }
        Ok(events)
    }

    pub fn list_notes(&self, job_id: &str) -> Result<Vec<Note>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT item_id, data_json FROM items
                 WHERE job_id = ?1 AND item_type = 'note'
                 ORDER BY position",
            )
            .map_err(db_err("クエリ準備失敗"))?;

        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err("クエリ実行失敗"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("行読み取り失敗"))?;

        rows.into_iter()
            .map(|(item_id, data_json)| {
                let mut note: Note = serde_json::from_str(&data_json)
                    .map_err(|e| AppError::storage(format!("メモ復元失敗 ({item_id}): {e}")))?;
                note.id = Some(item_id);
                Ok(note)
            })
            .collect()
    }

    /// 投稿済みイベントを同期済みにする。
    ///
    /// `synced = 0` の行だけを更新するため、既に同期済みのイベントのリンクは上書きされない。
    /// 未同期イベントが残らなければ会議の `calendar_synced` も立てる。更新件数を返す。
    pub fn mark_events_synced(
        &self,
        job_id: &str,
        posted: &[(String, String)],
    ) -> Result<u32, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("トランザクション開始失敗"))?;

        let mut updated = 0u32;
        for (item_id, link) in posted {
            updated += tx
                .execute(
                    "UPDATE items SET synced = 1, calendar_link = ?1
                     WHERE item_id = ?2 AND job_id = ?3 AND item_type = 'dated_event' AND synced = 0",
                    params![link, item_id, job_id],
                )
                .map_err(db_err("同期状態更新失敗"))? as u32;
        }

        let remaining: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM items
                 WHERE job_id = ?1 AND item_type = 'dated_event' AND synced = 0",
                params![job_id],
                |row| row.get(0),
            )
            .map_err(db_err("クエリ実行失敗"))?;
        if remaining == 0 {
            tx.execute(
                "UPDATE meetings SET calendar_synced = 1 WHERE job_id = ?1",
                params![job_id],
            )
            .map_err(db_err("会議同期フラグ更新失敗"))?;
        }

        tx.commit().map_err(db_err("コミット失敗"))?;
        Ok(updated)
    }

    // --- Item edits ---

    /// アイテムの所属（会議とオーナー）
    pub fn item_owner(&self, item_id: &str) -> Result<Option<ItemOwner>, AppError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT i.job_id, m.owner_id, i.item_type FROM items i
                 JOIN meetings m ON m.job_id = i.job_id
                 WHERE i.item_id = ?1",
                params![item_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?;

        Ok(row.and_then(|(job_id, owner_id, item_type)| {
            let kind = match item_type.as_str() {
                ITEM_DATED_EVENT => ItemKind::DatedEvent,
                ITEM_NOTE => ItemKind::Note,
                other => {
                    log::warn!("不明なアイテム種別です ({item_id}): {other}");
                    return None;
                }
            };
            Some(ItemOwner {
                job_id,
                owner_id,
                kind,
            })
        }))
    }

    /// 会議の末尾にメモを追加し、item_id を返す。
    pub fn add_note(&self, job_id: &str, note: &Note) -> Result<String, AppError> {
        let item_id = new_item_id();
        let data_json = to_json(note)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO items (item_id, job_id, item_type, position, data_json)
                 VALUES (?1, ?2, ?3,
                         (SELECT COALESCE(MAX(position), -1) + 1 FROM items
                          WHERE job_id = ?2 AND item_type = ?3),
                         ?4)",
                params![item_id, job_id, ITEM_NOTE, data_json],
            )
            .map_err(db_err("メモ保存失敗"))?;
        log::info!("会議 {job_id} にメモを追加しました: {}", note.title);
        Ok(item_id)
    }

    /// タスクの完了状態を更新する。イベントが存在しなければ `false`。
    pub fn set_event_completed(&self, item_id: &str, completed: bool) -> Result<bool, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("トランザクション開始失敗"))?;

        let data_json: Option<String> = tx
            .query_row(
                "SELECT data_json FROM items WHERE item_id = ?1 AND item_type = ?2",
                params![item_id, ITEM_DATED_EVENT],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?;
        let Some(data_json) = data_json else {
            return Ok(false);
        };

        let mut event: DatedEvent = serde_json::from_str(&data_json)
            .map_err(|e| AppError::storage(format!("イベント復元失敗 ({item_id}): {e}")))?;
        event.completed = completed;
        tx.execute(
            "UPDATE items SET data_json = ?1 WHERE item_id = ?2",
            params![to_json(&event)?, item_id],
        )
        .map_err(db_err("完了状態更新失敗"))?;

        tx.commit().map_err(db_err("コミット失敗"))?;
        Ok(true)
    }

    /// アイテムを1件削除する。
    ///
    /// イベント削除で未同期イベントがなくなれば会議の `calendar_synced` を立てる。
    pub fn delete_item(&self, item_id: &str, kind: ItemKind) -> Result<bool, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("トランザクション開始失敗"))?;

        let job_id: Option<String> = tx
            .query_row(
                "SELECT job_id FROM items WHERE item_id = ?1 AND item_type = ?2",
                params![item_id, item_type(kind)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?;
        let Some(job_id) = job_id else {
            return Ok(false);
        };

        tx.execute("DELETE FROM items WHERE item_id = ?1", params![item_id])
            .map_err(db_err("アイテム削除失敗"))?;

        if kind == ItemKind::DatedEvent {
            tx.execute(
                "UPDATE meetings SET calendar_synced = 1
                 WHERE job_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM items WHERE job_id = ?1
                                   AND item_type = 'dated_event' AND synced = 0)
                   AND EXISTS (SELECT 1 FROM items WHERE job_id = ?1
                               AND item_type = 'dated_event' AND synced = 1)",
                params![job_id],
            )
            .map_err(db_err("会議同期フラグ更新失敗"))?;
        }

        tx.commit().map_err(db_err("コミット失敗"))?;
        log::info!("会議 {job_id} のアイテムを削除しました: {item_id}");
        Ok(true)
    }

    // --- Analytics ---

    /// オーナーの会議を集計する。`now` は直近30日と月別集計の基準。
    pub fn owner_analytics(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MeetingAnalytics, AppError> {
        let cutoff = (now - Duration::days(RECENT_DAYS))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let conn = self.conn.lock();

        let (total, synced, with_duration, total_duration, avg_processing, recent) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(calendar_synced), 0),
                        COUNT(CASE WHEN audio_duration_secs > 0 THEN 1 END),
                        COALESCE(SUM(CASE WHEN audio_duration_secs > 0 THEN audio_duration_secs END), 0),
                        AVG(processing_secs),
                        COUNT(CASE WHEN created_at >= ?2 THEN 1 END)
                 FROM meetings WHERE owner_id = ?1",
                params![owner_id, cutoff],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, u32>(5)?,
                    ))
                },
            )
            .map_err(db_err("集計失敗"))?;

        let (total_events, total_notes) = conn
            .query_row(
                "SELECT COALESCE(SUM(i.item_type = 'dated_event'), 0),
                        COALESCE(SUM(i.item_type = 'note'), 0)
                 FROM items i JOIN meetings m ON m.job_id = i.job_id
                 WHERE m.owner_id = ?1",
                params![owner_id],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
            )
            .map_err(db_err("集計失敗"))?;

        let calendar_connected = conn
            .query_row(
                "SELECT connected FROM calendar_credentials WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get::<_, i32>(0),
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?
            .is_some_and(|c| c != 0);

        let mut stmt = conn
            .prepare(
                "SELECT substr(created_at, 1, 7), COUNT(*) FROM meetings
                 WHERE owner_id = ?1 GROUP BY 1",
            )
            .map_err(db_err("クエリ準備失敗"))?;
        let by_month: HashMap<String, u32> = stmt
            .query_map(params![owner_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err("クエリ実行失敗"))?
            .collect::<Result<_, _>>()
            .map_err(db_err("行読み取り失敗"))?;

        Ok(MeetingAnalytics {
            total_meetings: total,
            total_events,
            total_notes,
            avg_duration_secs: if with_duration > 0 {
                total_duration / with_duration as f64
            } else {
                0.0
            },
            total_audio_duration_secs: total_duration,
            meetings_with_audio_duration: with_duration,
            avg_processing_secs: avg_processing.unwrap_or(0.0),
            meetings_last_30_days: recent,
            calendar_synced_meetings: synced,
            calendar_connected,
            meetings_by_month: last_months(now, MONTHS_IN_CHART)
                .into_iter()
                .map(|month| MonthlyCount {
                    count: by_month.get(&month).copied().unwrap_or(0),
                    month,
                })
                .collect(),
        })
    }

    // --- Calendar credentials ---

    pub fn get_calendar_credential(
        &self,
        owner_id: &str,
    ) -> Result<Option<CalendarCredential>, AppError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT access_token, refresh_token, expires_at, connected
                 FROM calendar_credentials WHERE owner_id = ?1",
                params![owner_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i32>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?;

        Ok(row.map(|(access_token, refresh_token, expires_at, connected)| {
            CalendarCredential {
                access_token,
                refresh_token,
                expires_at: expires_at.as_deref().and_then(|s| {
                    chrono::DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|d| d.with_timezone(&chrono::Utc))
                }),
                connected: connected != 0,
            }
        }))
    }

    pub fn save_calendar_credential(
        &self,
        owner_id: &str,
        credential: &CalendarCredential,
    ) -> Result<(), AppError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO calendar_credentials
                    (owner_id, access_token, refresh_token, expires_at, connected, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(owner_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    connected = excluded.connected,
                    updated_at = excluded.updated_at",
                params![
                    owner_id,
                    credential.access_token,
                    credential.refresh_token,
                    credential.expires_at.map(|d| d.to_rfc3339()),
                    credential.connected as i32,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err("認証情報保存失敗"))?;
        Ok(())
    }

    /// 連携解除。トークンは破棄する。
    pub fn disconnect_calendar(&self, owner_id: &str) -> Result<bool, AppError> {
        let affected = self
            .conn
            .lock()
            .execute(
                "UPDATE calendar_credentials
                 SET access_token = '', refresh_token = NULL, expires_at = NULL,
                     connected = 0, updated_at = ?2
                 WHERE owner_id = ?1",
                params![owner_id, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(db_err("連携解除失敗"))?;
        Ok(affected > 0)
    }

    // --- Presets ---

    /// プリセットを保存する。`is_default` ならオーナーの他のプリセットの既定を外す。
    pub fn save_preset(&self, preset: &Preset) -> Result<String, AppError> {
        let id = preset
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let config_json = to_json(&preset.config)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err("トランザクション開始失敗"))?;

        // 別オーナーの ID を上書きしない
        let existing_owner: Option<String> = tx
            .query_row(
                "SELECT owner_id FROM presets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("クエリ実行失敗"))?;
        if existing_owner.is_some_and(|owner| owner != preset.owner_id) {
            return Err(AppError::forbidden(format!("preset {id} belongs to another user")));
        }

        if preset.is_default {
            tx.execute(
                "UPDATE presets SET is_default = 0 WHERE owner_id = ?1 AND id != ?2",
                params![preset.owner_id, id],
            )
            .map_err(db_err("既定プリセット更新失敗"))?;
        }

        tx.execute(
            "INSERT INTO presets (id, owner_id, name, config_json, is_default)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                config_json = excluded.config_json,
                is_default = excluded.is_default",
            params![id, preset.owner_id, preset.name, config_json, preset.is_default as i32],
        )
        .map_err(db_err("プリセット保存失敗"))?;

        tx.commit().map_err(db_err("コミット失敗"))?;
        Ok(id)
    }

    /// 既定プリセットを先頭に、名前順で返す。
    pub fn list_presets(&self, owner_id: &str) -> Result<Vec<Preset>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, owner_id, name, config_json, is_default FROM presets
                 WHERE owner_id = ?1
                 ORDER BY is_default DESC, name",
            )
            .map_err(db_err("クエリ準備失敗"))?;

        let presets = stmt
            .query_map(params![owner_id], |row| {
                let config_json: String = row.get(3)?;
                let is_default: i32 = row.get(4)?;
                Ok(Preset {
                    id: Some(row.get(0)?),
                    owner_id: row.get(1)?,
                    name: row.get(2)?,
                    config: from_json_or_default(&config_json),
                    is_default: is_default != 0,
                })
            })
            .map_err(db_err("クエリ実行失敗"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("行読み取り失敗"))?;

        Ok(presets)
    }

    pub fn delete_preset(&self, owner_id: &str, id: &str) -> Result<bool, AppError> {
        let affected = self
            .conn
            .lock()
            .execute(
                "DELETE FROM presets WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
            )
            .map_err(db_err("プリセット削除失敗"))?;
        Ok(affected > 0)
    }

    // --- Settings ---

    pub fn get_settings(&self) -> Result<PipelineSettings, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(db_err("クエリ準備失敗"))?;

        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err("クエリ実行失敗"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("行読み取り失敗"))?;

        if rows.is_empty() {
            return Ok(PipelineSettings::default());
        }

        // key-value をJSONに組み立ててデシリアライズ（欠けたキーは既定値）
        let map: serde_json::Map<String, serde_json::Value> = rows
            .into_iter()
            .map(|(key, value)| {
                let v = serde_json::from_str(&value)
                    .unwrap_or(serde_json::Value::String(value));
                (key, v)
            })
            .collect();

        match serde_json::from_value::<PipelineSettings>(serde_json::Value::Object(map)) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("設定を読み込めないため既定値を使います: {e}");
                Ok(PipelineSettings::default())
            }
        }
    }

    pub fn save_settings(&self, settings: &PipelineSettings) -> Result<(), AppError> {
        let json = serde_json::to_value(settings)
            .map_err(|e| AppError::internal(format!("settings serialize: {e}")))?;

        let conn = self.conn.lock();
        if let Some(obj) = json.as_object() {
            for (key, value) in obj {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value.to_string()],
                )
                .map_err(db_err("設定保存失敗"))?;
            }
        }

        Ok(())
    }
}

fn item_type(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::DatedEvent => ITEM_DATED_EVENT,
        ItemKind::Note => ITEM_NOTE,
    }
}

/// `now` を含む直近 `count` か月の `YYYY-MM`（古い順）
fn last_months(now: DateTime<Utc>, count: u32) -> Vec<String> {
    let mut year = now.year();
    let mut month = now.month();
    let mut months = Vec::with_capacity(count as usize);
    for _ in 0..count {
        months.push(format!("{year:04}-{month:02}"));
        if month == 1 {
            month = 12;
            year -= 1;
        } else {
            month -= 1;
        }
    }
    months.reverse();
    months
}

fn new_item_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string(value).map_err(|e| AppError::internal(format!("serialize: {e}")))
}

fn from_json_or_default<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        log::warn!("保存済み JSON を復元できません: {e}");
        T::default()
    })
}
