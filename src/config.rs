// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CallError, Result};

// В релизе остаются только info и выше, см. logger::default_directive
pub const LOGGING_ENABLED: bool = true;

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
    pub const VERBOSE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // В продакшене все дополнительные настройки отключены
    pub const VERBOSE_LOGGING: bool = false;
    pub const ENABLE_LOGGING: bool = true;
}

/// Переменная окружения с путём к JSON конфигу
pub const CONFIG_PATH_ENV: &str = "MENTORCALL_CONFIG";
/// Переменная окружения, переопределяющая адрес сигнального сервера
pub const SIGNALING_URL_ENV: &str = "MENTORCALL_SIGNALING_URL";

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8000";

/// STUN сервер по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![ServerConfig {
        id: "default-stun".into(),
        r#type: ServerKind::Stun,
        url: "stun:stun.l.google.com:19302".into(),
        username: None,
        credential: None,
    }]
});

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: ServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(CallError::Config(format!(
                "ICE server {:?}: URL cannot be empty",
                self.id
            )));
        }
        if self.r#type == ServerKind::Turn
            && (self.username.is_none() || self.credential.is_none())
        {
            return Err(CallError::Config(format!(
                "ICE server {:?}: TURN servers require username and credential",
                self.id
            )));
        }
        Ok(())
    }
}

/// Настройки звонка
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Базовый адрес сигнального сервера, например `ws://localhost:8000`
    pub signaling_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub grace_period_secs: u64,
    pub ice_candidate_pool_size: u8,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            grace_period_secs: crate::peer::state::GRACE_PERIOD.as_secs(),
            ice_candidate_pool_size: 10,
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: CallConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Конфиг из окружения: файл из `MENTORCALL_CONFIG` (если задан),
    /// поверх него `MENTORCALL_SIGNALING_URL`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        if let Ok(url) = std::env::var(SIGNALING_URL_ENV) {
            if !url.is_empty() {
                cfg.signaling_url = url;
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(CallError::Config(format!(
                "signaling URL must use ws:// or wss:// (got {:?})",
                self.signaling_url
            )));
        }
        if self.ice_servers.is_empty() {
            return Err(CallError::Config(
                "at least one ICE server is required".into(),
            ));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = CallConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.grace_period(), Duration::from_secs(10));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = CallConfig::from_json(r#"{"signaling_url":"wss://example.org"}"#).unwrap();
        assert_eq!(cfg.signaling_url, "wss://example.org");
        assert_eq!(cfg.ice_servers, *DEFAULT_ICE_SERVERS);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let json = r#"{
            "ice_servers": [
                {"id": "t1", "type": "turn", "url": "turn.example.org:3478", "username": "u"}
            ]
        }"#;
        let err = CallConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("TURN servers require"));
    }

    #[test]
    fn empty_ice_server_list_is_rejected() {
        let err = CallConfig::from_json(r#"{"ice_servers": []}"#).unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn http_signaling_url_is_rejected() {
        let cfg = CallConfig {
            signaling_url: "http://localhost:8000".into(),
            ..CallConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
