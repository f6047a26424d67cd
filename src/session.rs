use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CallError, Result};

/// Идентификатор сессии (бронирования), в рамках которой идёт звонок.
/// Задаёт адрес сигнального канала и не меняется за время звонка.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Сервер маршрутизирует `ws/signaling/(?P<room_name>\w+)/`, поэтому
    /// допускаются только буквы, цифры и `_`.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || !raw.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(CallError::InvalidSession(raw));
        }
        Ok(SessionId(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Полный адрес сигнального канала для этой сессии
    pub fn signaling_endpoint(&self, base_url: &str) -> String {
        format!("{}/ws/signaling/{}/", base_url.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CallError;

    fn try_from(value: String) -> Result<Self> {
        SessionId::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_session_scoped() {
        let id = SessionId::new("42").unwrap();
        assert_eq!(
            id.signaling_endpoint("ws://localhost:8000/"),
            "ws://localhost:8000/ws/signaling/42/"
        );
    }

    #[test]
    fn rejects_empty_and_path_like_ids() {
        assert!(matches!(SessionId::new(""), Err(CallError::InvalidSession(_))));
        assert!(SessionId::new("../admin").is_err());
        assert!(SessionId::new("a b").is_err());
        assert!(SessionId::new("booking_17").is_ok());
    }
}
