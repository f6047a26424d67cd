use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::CallError;
use crate::peer::state::CallState;
use crate::peer::types::{CallEvent, IceCandidate, RemoteTrack};

/// Фильтр по умолчанию, если `RUST_LOG` не задан
fn default_directive() -> &'static str {
    if crate::config::dev::VERBOSE_LOGGING {
        "mentorcall=debug,webrtc=warn"
    } else {
        "mentorcall=info,webrtc=error"
    }
}

/// Логирование с временными метками. Повторный вызов ничего не делает.
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Отправка событий звонка в UI. Если UI уже не слушает, события теряются.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl EventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, evt: CallEvent) {
        debug!("emit {:?}", evt);
        if self.tx.send(evt).is_err() {
            debug!("No event listener, event dropped");
        }
    }

    pub fn emit_state(&self, state: CallState) {
        self.emit(CallEvent::StateChanged(state));
    }

    /// Ошибка уровня звонка: всегда видна пользователю
    pub fn emit_error(&self, err: &CallError) {
        warn!("Call error ({:?}): {err}", err.kind());
        self.emit(CallEvent::Error {
            kind: err.kind(),
            message: err.user_message(),
        });
    }

    pub fn emit_remote_track(&self, track: RemoteTrack) {
        self.emit(CallEvent::RemoteTrack(track));
    }

    pub fn emit_session_completed(&self) {
        self.emit(CallEvent::SessionCompleted);
    }

    pub fn emit_connection_problem(&self) {
        info!("Connection issues detected");
        self.emit(CallEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovered(&self) {
        info!("Connection recovered");
        self.emit(CallEvent::ConnectionRecovered);
    }

    pub fn emit_connection_failed(&self) {
        warn!("Connection recovery failed");
        self.emit(CallEvent::ConnectionFailed);
    }

    pub fn emit_audio_toggled(&self, enabled: bool) {
        self.emit(CallEvent::AudioToggled(enabled));
    }

    pub fn emit_video_toggled(&self, enabled: bool) {
        self.emit(CallEvent::VideoToggled(enabled));
    }

    pub fn emit_screen_share_toggled(&self, sharing: bool) {
        self.emit(CallEvent::ScreenShareToggled(sharing));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_is_on_in_every_build() {
        assert!(crate::config::LOGGING_ENABLED);
        assert!(crate::config::dev::ENABLE_LOGGING);
        let expected = if cfg!(debug_assertions) {
            "mentorcall=debug,webrtc=warn"
        } else {
            "mentorcall=info,webrtc=error"
        };
        assert_eq!(default_directive(), expected);
    }

    #[test]
    fn init_can_be_called_twice() {
        init();
        init();
        info!("logger initialised");
    }

    #[test]
    fn emitter_survives_dropped_listener() {
        let (events, rx) = EventEmitter::new();
        events.emit_screen_share_toggled(true);
        drop(rx);
        events.emit_screen_share_toggled(false);
    }
}
