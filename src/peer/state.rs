use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// ========== CALL STATE ==========

/// Состояние машины переговоров.
///
/// `Idle → ConnectingLocalMedia → Negotiating → Connected → Ended`; любая
/// неустранимая ошибка возвращает машину в `Idle`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    ConnectingLocalMedia,
    Negotiating,
    Connected,
    Ended,
}

impl CallState {
    /// Звонок начат и ещё не завершён
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallState::ConnectingLocalMedia | CallState::Negotiating | CallState::Connected
        )
    }

    /// Можно ли начать новый звонок из этого состояния
    pub fn can_start(self) -> bool {
        matches!(self, CallState::Idle | CallState::Ended)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            // возврат с ошибкой возможен отовсюду
            (_, Idle) => true,
            (Idle | Ended, ConnectingLocalMedia) => true,
            (ConnectingLocalMedia, Negotiating) => true,
            // повторный offer пересоздаёт соединение
            (Negotiating | Connected, Negotiating) => true,
            (Negotiating, Connected) => true,
            (ConnectingLocalMedia | Negotiating | Connected, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::ConnectingLocalMedia => "connecting-local-media",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// ========== CONSTANTS ==========

/// Период ожидания восстановления соединения перед `ConnectionFailed`
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Сколько ждать подходящего кандидата при проверке ICE сервера
pub const ICE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::CallState::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Idle.can_transition_to(ConnectingLocalMedia));
        assert!(ConnectingLocalMedia.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Ended));
        assert!(Ended.can_transition_to(ConnectingLocalMedia));
    }

    #[test]
    fn rejects_skipping_states() {
        assert!(!Idle.can_transition_to(Negotiating));
        assert!(!Idle.can_transition_to(Connected));
        assert!(!ConnectingLocalMedia.can_transition_to(Connected));
        assert!(!Ended.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(Ended));
    }

    #[test]
    fn errors_fall_back_to_idle_from_anywhere() {
        for st in [Idle, ConnectingLocalMedia, Negotiating, Connected, Ended] {
            assert!(st.can_transition_to(Idle));
        }
    }

    #[test]
    fn only_idle_or_ended_can_start() {
        assert!(Idle.can_start());
        assert!(Ended.can_start());
        assert!(!Negotiating.can_start());
        assert!(!Connected.can_start());
        assert!(!ConnectingLocalMedia.can_start());
    }
}
