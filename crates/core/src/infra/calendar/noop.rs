use async_trait::async_trait;

use super::{CalendarError, CalendarProvider};
use crate::domain::calendar::CalendarCredential;
use crate::domain::extraction::DatedEvent;

/// NoopCalendarProvider: 外部に投稿せず、ローカルのダミーリンクを返す。
/// カレンダー未設定の環境と開発用。
pub struct NoopCalendarProvider;

#[async_trait]
impl CalendarProvider for NoopCalendarProvider {
    async fn post_event(
        &self,
        _credential: &CalendarCredential,
        event: &DatedEvent,
    ) -> Result<String, CalendarError> {
        let id = event
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(format!("noop://calendar/{id}"))
    }

    async fn refresh_credential(
        &self,
        credential: &CalendarCredential,
    ) -> Result<CalendarCredential, CalendarError> {
        Ok(CalendarCredential {
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            ..credential.clone()
        })
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_link_uses_event_id() {
        let credential = CalendarCredential {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: None,
            connected: true,
        };
        let event = DatedEvent {
            id: Some("e1".into()),
            title: "Review".into(),
            date: "2025-01-01".into(),
            formatted_date: "January 1, 2025".into(),
            assignee: "Unassigned".into(),
            description: String::new(),
            urgent: false,
            synced: false,
            completed: false,
            calendar_link: None,
        };
        let link = NoopCalendarProvider.post_event(&credential, &event).await.unwrap();
        assert_eq!(link, "noop://calendar/e1");
    }
}
