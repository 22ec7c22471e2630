use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{CalendarError, CalendarProvider};
use crate::domain::calendar::CalendarCredential;
use crate::domain::extraction::DatedEvent;

const EVENTS_URL: &str = "https://www.googleapis.com/calendar/v3/calendars/primary/events";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// 日付未定のイベントを何日後に置くか
const UNDATED_OFFSET_DAYS: i64 = 7;
const MAX_SUMMARY_CHARS: usize = 90;
/// Google Calendar の色 ID（赤）
const TASK_COLOR_ID: &str = "11";

/// Google Calendar API クライアント
pub struct GoogleCalendarProvider {
    client: reqwest::Client,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct EventBody {
    summary: String,
    description: String,
    start: EventDate,
    end: EventDate,
    #[serde(rename = "colorId")]
    color_id: String,
}

#[derive(Debug, Serialize)]
struct EventDate {
    date: String,
}

#[derive(Deserialize)]
struct CreatedEvent {
    #[serde(rename = "htmlLink")]
    html_link: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

impl GoogleCalendarProvider {
    pub fn new(
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self, CalendarError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CalendarError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            client_id,
            client_secret,
        })
    }

    /// 終日イベントの本文を組み立てる。未定の日付は `today + 7日` に置く。
    fn event_body(event: &DatedEvent, today: NaiveDate) -> EventBody {
        let day = event
            .parsed_date()
            .unwrap_or(today + Duration::days(UNDATED_OFFSET_DAYS));
        // 終日イベントの end は排他的
        let next_day = day + Duration::days(1);

        let title = if event.title.trim().is_empty() {
            "Untitled Task"
        } else {
            event.title.trim()
        };
        let short: String = title.chars().take(MAX_SUMMARY_CHARS).collect();
        let context = if event.description.is_empty() {
            "N/A"
        } else {
            event.description.as_str()
        };

        EventBody {
            summary: format!("🔴 {short}"),
            description: format!(
                "Task: {title}\nAssignee: {}\nContext: {context}",
                event.assignee
            ),
            start: EventDate {
                date: day.format("%Y-%m-%d").to_string(),
            },
            end: EventDate {
                date: next_day.format("%Y-%m-%d").to_string(),
            },
            color_id: TASK_COLOR_ID.to_string(),
        }
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarProvider {
    async fn post_event(
        &self,
        credential: &CalendarCredential,
        event: &DatedEvent,
    ) -> Result<String, CalendarError> {
        let body = Self::event_body(event, Utc::now().date_naive());

        let response = self
            .client
            .post(EVENTS_URL)
            .bearer_auth(&credential.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CalendarError::RequestFailed(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CalendarError::Unauthorized(
                "access token rejected".to_string(),
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CalendarError::RequestFailed(format!(
                "Calendar API error: {status} - {text}"
            )));
        }

        let created: CreatedEvent = response
            .json()
            .await
            .map_err(|e| CalendarError::RequestFailed(format!("Response parse error: {e}")))?;

        created
            .html_link
            .or(created.id)
            .ok_or_else(|| CalendarError::RequestFailed("event created without link".to_string()))
    }

    async fn refresh_credential(
        &self,
        credential: &CalendarCredential,
    ) -> Result<CalendarCredential, CalendarError> {
        let (Some(client_id), Some(client_secret)) =
            (self.client_id.as_deref(), self.client_secret.as_deref())
        else {
            return Err(CalendarError::NotConfigured(
                "Google client id/secret is not set".to_string(),
            ));
        };
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CalendarError::RefreshFailed("no refresh token".to_string()))?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| CalendarError::RefreshFailed(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CalendarError::RefreshFailed(format!("{status} - {text}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CalendarError::RefreshFailed(format!("Response parse error: {e}")))?;

        log::info!("カレンダーのアクセストークンを更新しました");

        Ok(CalendarCredential {
            access_token: token.access_token,
            // 新しいリフレッシュトークンが返らない場合は既存を維持
            refresh_token: token.refresh_token.or_else(|| credential.refresh_token.clone()),
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            connected: true,
        })
    }

    fn name(&self) -> &str {
        "google"
    }
}
