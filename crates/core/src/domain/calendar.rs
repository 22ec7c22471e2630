use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 有効期限の何秒前から期限切れとみなすか
const EXPIRY_SKEW_SECS: i64 = 60;

/// ユーザーのカレンダー認証情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// アクセストークンの有効期限。不明な場合は `None`（期限切れ扱いしない）。
    pub expires_at: Option<DateTime<Utc>>,
    pub connected: bool,
}

impl CalendarCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now,
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }
}

/// 手動/自動同期の結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// 今回投稿されたイベントのリンク
    pub event_links: Vec<String>,
    pub posted: u32,
    pub failed: u32,
    /// 同期対象が残っていなかった
    pub already_synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: Option<DateTime<Utc>>) -> CalendarCredential {
        CalendarCredential {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at,
            connected: true,
        }
    }

    #[test]
    fn expiry_uses_skew() {
        let now = Utc::now();
        assert!(credential(Some(now - Duration::seconds(1))).is_expired(now));
        assert!(credential(Some(now + Duration::seconds(30))).is_expired(now));
        assert!(!credential(Some(now + Duration::minutes(10))).is_expired(now));
        assert!(!credential(None).is_expired(now));
    }

    #[test]
    fn refresh_requires_token() {
        let mut c = credential(None);
        assert!(c.can_refresh());
        c.refresh_token = Some(String::new());
        assert!(!c.can_refresh());
        c.refresh_token = None;
        assert!(!c.can_refresh());
    }
}
