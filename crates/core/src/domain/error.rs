use serde::Serialize;

/// アプリケーション共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_FORBIDDEN")]
    Forbidden,
    #[serde(rename = "E_NOT_READY")]
    NotReady,
    #[serde(rename = "E_JOB_FAILED")]
    JobFailed,
    #[serde(rename = "E_INVALID_INPUT")]
    InvalidInput,
    #[serde(rename = "E_TRANSCRIPTION")]
    Transcription,
    #[serde(rename = "E_EXTRACTION")]
    Extraction,
    #[serde(rename = "E_CALENDAR")]
    Calendar,
    #[serde(rename = "E_CALENDAR_NOT_CONNECTED")]
    CalendarNotConnected,
    #[serde(rename = "E_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "E_INTERNAL")]
    Internal,
    #[serde(rename = "E_STORAGE")]
    Storage,
}

impl ErrorCode {
    /// ワイヤ表現（`E_...`）
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "E_NOT_FOUND",
            ErrorCode::Forbidden => "E_FORBIDDEN",
            ErrorCode::NotReady => "E_NOT_READY",
            ErrorCode::JobFailed => "E_JOB_FAILED",
            ErrorCode::InvalidInput => "E_INVALID_INPUT",
            ErrorCode::Transcription => "E_TRANSCRIPTION",
            ErrorCode::Extraction => "E_EXTRACTION",
            ErrorCode::Calendar => "E_CALENDAR",
            ErrorCode::CalendarNotConnected => "E_CALENDAR_NOT_CONNECTED",
            ErrorCode::InvalidState => "E_INVALID_STATE",
            ErrorCode::Internal => "E_INTERNAL",
            ErrorCode::Storage => "E_STORAGE",
        }
    }
}

/// アプリケーションエラー（外部 API のエラーペイロード兼用）
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            message: msg.into(),
            recoverable: false,
        }
    }

    /// 処理中のジョブに結果を要求した場合。ポーリング継続で回復する。
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotReady,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::JobFailed,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn transcription(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Transcription,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Extraction,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn calendar(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Calendar,
            message: msg.into(),
            recoverable: true,
        }
    }

    /// カレンダー未連携。ユーザーの接続操作で回復する。
    pub fn calendar_not_connected(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CalendarNotConnected,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidState,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Storage,
            message: msg.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_code_and_recoverable() {
        let e = AppError::not_ready("still processing");
        assert_eq!(e.code, ErrorCode::NotReady);
        assert!(e.recoverable);

        let e = AppError::forbidden("not yours");
        assert_eq!(e.code, ErrorCode::Forbidden);
        assert!(!e.recoverable);

        let e = AppError::calendar_not_connected("connect first");
        assert_eq!(e.code, ErrorCode::CalendarNotConnected);
        assert!(e.recoverable);
    }

    #[test]
    fn display_uses_wire_code() {
        let e = AppError::job_failed("Transcription failed: boom");
        assert_eq!(e.to_string(), "[E_JOB_FAILED] Transcription failed: boom");
    }
}
