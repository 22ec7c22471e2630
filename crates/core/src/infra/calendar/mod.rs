pub mod google;
mod noop;

pub use noop::NoopCalendarProvider;

use async_trait::async_trait;

use crate::domain::calendar::CalendarCredential;
use crate::domain::extraction::DatedEvent;

/// カレンダー連携エラー
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Calendar credential rejected: {0}")]
    Unauthorized(String),
    #[error("Calendar token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("Calendar request failed: {0}")]
    RequestFailed(String),
    #[error("Calendar provider not configured: {0}")]
    NotConfigured(String),
}

/// 外部カレンダー trait
///
/// 投稿は冪等ではない。重複投稿の防止は呼び出し側（`CalendarReconciler`）の責務。
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// 終日イベントを1件作成し、閲覧リンクを返す。
    async fn post_event(
        &self,
        credential: &CalendarCredential,
        event: &DatedEvent,
    ) -> Result<String, CalendarError>;

    /// リフレッシュトークンでアクセストークンを更新する。
    async fn refresh_credential(
        &self,
        credential: &CalendarCredential,
    ) -> Result<CalendarCredential, CalendarError>;

    fn name(&self) -> &str;
}
