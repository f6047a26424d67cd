use thiserror::Error;

use crate::peer::types::Role;

/// Ошибки захвата локальных устройств
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Класс ошибки для решения: логировать молча или показать пользователю
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Сигнальный канал закрыт или недоступен, звонок нужно начинать заново
    Transport,
    /// Ошибка обмена описаниями, звонок можно повторить
    Negotiation,
    /// Нет доступа к камере/микрофону
    Device,
    /// Ошибка применения одного кандидата, не фатальна
    Candidate,
    /// Неверное использование API (звонок уже идёт, неверная роль и т.п.)
    Usage,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("session id must be a non-empty word (got {0:?})")]
    InvalidSession(String),

    #[error("{op} is not valid for role {role}")]
    InvalidRole { op: &'static str, role: Role },

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("call start was cancelled")]
    Cancelled,

    #[error("no active peer connection")]
    NoConnection,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("negotiation failed at {step}: {reason}")]
    Negotiation { step: &'static str, reason: String },

    #[error("failed to apply ICE candidate: {0}")]
    Candidate(String),

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl CallError {
    pub fn negotiation(step: &'static str, reason: impl ToString) -> Self {
        CallError::Negotiation {
            step,
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Transport(_) | CallError::ChannelClosed | CallError::WebSocket(_) => {
                ErrorKind::Transport
            }
            CallError::Media(_) => ErrorKind::Device,
            CallError::Candidate(_) => ErrorKind::Candidate,
            CallError::Negotiation { .. } | CallError::Rtc(_) | CallError::Json(_) => {
                ErrorKind::Negotiation
            }
            CallError::InvalidSession(_)
            | CallError::InvalidRole { .. }
            | CallError::CallInProgress
            | CallError::Cancelled
            | CallError::NoConnection
            | CallError::Config(_) => ErrorKind::Usage,
        }
    }

    /// Текст для пользователя (тост/алерт)
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Device => match self {
                CallError::Media(MediaError::DeviceUnavailable(_)) => {
                    "No camera or microphone found.".into()
                }
                _ => "Please allow camera/mic access.".into(),
            },
            ErrorKind::Transport => "Signaling connection lost. Start the call again.".into(),
            ErrorKind::Negotiation | ErrorKind::Candidate => "Connection failed, try again.".into(),
            ErrorKind::Usage => self.to_string(),
        }
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
