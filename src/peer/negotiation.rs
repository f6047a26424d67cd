//! Машина состояний переговоров.
//!
//! Все переходы выполняются последовательно на одном логическом потоке:
//! входящие конверты, события соединения и действия пользователя подаются
//! по одному через `&mut self`. Пока шаг ждёт (захват устройств, установка
//! описаний), остальные события копятся в своих очередях.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CallError, MediaError, Result};
use crate::logger::EventEmitter;
use crate::media::{LocalStream, MediaRequest, MediaSessionController};
use crate::peer::connection::{PeerConnectionFactory, PeerConnectionManager};
use crate::peer::ice::analyze_candidates;
use crate::peer::state::CallState;
use crate::peer::types::{
    ConnectionState, IceCandidate, PeerEvent, PeerNotice, Role, TrackKind,
};
use crate::signaling::{ChannelEvent, Envelope, SignalingChannel};

pub struct Negotiator {
    role: Role,
    state: CallState,
    signaling: Arc<SignalingChannel>,
    media: MediaSessionController,
    peer: PeerConnectionManager,
    local_stream: Option<Arc<LocalStream>>,
    screen_stream: Option<Arc<LocalStream>>,
    /// Offer, пришедший раньше, чем готово локальное медиа
    pending_offer: Option<String>,
    events: EventEmitter,
    notices: mpsc::UnboundedSender<PeerNotice>,
    grace_period: Duration,
    grace_task: Option<JoinHandle<()>>,
    degraded: bool,
    connected_at: Option<DateTime<Utc>>,
}

impl Negotiator {
    pub fn new(
        role: Role,
        signaling: Arc<SignalingChannel>,
        media: MediaSessionController,
        factory: Arc<dyn PeerConnectionFactory>,
        events: EventEmitter,
        grace_period: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PeerNotice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let peer = PeerConnectionManager::new(role, factory, signaling.clone(), notices.clone());
        let negotiator = Self {
            role,
            state: CallState::Idle,
            signaling,
            media,
            peer,
            local_stream: None,
            screen_stream: None,
            pending_offer: None,
            events,
            notices,
            grace_period,
            grace_task: None,
            degraded: false,
            connected_at: None,
        };
        (negotiator, notices_rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer(&self) -> &PeerConnectionManager {
        &self.peer
    }

    pub fn signaling(&self) -> &Arc<SignalingChannel> {
        &self.signaling
    }

    pub fn local_stream(&self) -> Option<&Arc<LocalStream>> {
        self.local_stream.as_ref()
    }

    /// Момент перехода в `Connected`
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    fn transition(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Ignoring invalid transition {} -> {}", self.state, next);
            return;
        }
        info!("Call state: {} -> {}", self.state, next);
        match next {
            CallState::Connected => self.connected_at = Some(Utc::now()),
            CallState::Ended => {
                if let Some(at) = self.connected_at.take() {
                    info!("Call lasted {} s", (Utc::now() - at).num_seconds());
                }
            }
            CallState::Idle => self.connected_at = None,
            _ => {}
        }
        self.state = next;
        self.events.emit_state(next);
    }

    /// Начало звонка: захват устройств, создание соединения, у инициатора offer.
    pub async fn start_call(&mut self) -> Result<()> {
        let request = self.begin_call()?;
        let acquired = request.acquire().await;
        self.complete_call(acquired).await
    }

    /// Первая половина `start_call`: переход в `ConnectingLocalMedia` и
    /// запрос устройств. Сам захват выполняет вызывающий, и он же может его
    /// бросить, если пользователь тем временем завершил звонок.
    pub fn begin_call(&mut self) -> Result<MediaRequest> {
        if !self.state.can_start() {
            return Err(CallError::CallInProgress);
        }
        if !self.signaling.is_open() {
            let err = CallError::ChannelClosed;
            self.events.emit_error(&err);
            return Err(err);
        }
        self.transition(CallState::ConnectingLocalMedia);
        Ok(self.media.request())
    }

    /// Вторая половина `start_call`: результат захвата.
    /// Если звонок уже отменён, поток сразу освобождается и offer не уходит.
    pub async fn complete_call(
        &mut self,
        acquired: Result<Arc<LocalStream>, MediaError>,
    ) -> Result<()> {
        if self.state != CallState::ConnectingLocalMedia {
            if let Ok(stream) = &acquired {
                self.media.release(Some(stream.as_ref()));
            }
            info!("Call start cancelled while acquiring local media");
            return Err(CallError::Cancelled);
        }

        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                let err = CallError::from(e);
                error!("Error accessing media devices: {err}");
                self.transition(CallState::Idle);
                self.events.emit_error(&err);
                return Err(err);
            }
        };
        self.local_stream = Some(stream.clone());

        if let Err(err) = self.peer.create().await {
            error!("Failed to create peer connection: {err}");
            self.media.release(self.local_stream.take().as_deref());
            self.transition(CallState::Idle);
            self.events.emit_error(&err);
            return Err(err);
        }
        self.transition(CallState::Negotiating);

        if let Err(err) = self.peer.attach_local_tracks(&stream).await {
            error!("Failed to start negotiation: {err}");
            self.events.emit_error(&err);
            return Err(err);
        }
        info!(role = %self.role, "Call started");

        if let Some(sdp) = self.pending_offer.take() {
            debug!("Processing offer received before local media was ready");
            self.on_offer(sdp).await;
        }
        Ok(())
    }

    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Envelope(env) => self.handle_envelope(env).await,
            ChannelEvent::Closed(reason) => self.on_transport_closed(reason).await,
        }
    }

    pub async fn handle_envelope(&mut self, env: Envelope) {
        debug!(state = %self.state, "Handling {} envelope", env.label());
        match env {
            Envelope::Offer { sdp } => {
                if self.role != Role::Responder {
                    debug!("Initiator ignores incoming offer");
                    return;
                }
                match self.state {
                    // инициатор мог перезапустить звонок раньше нас
                    CallState::Idle | CallState::ConnectingLocalMedia | CallState::Ended => {
                        debug!("Local media not ready, holding offer");
                        self.pending_offer = Some(sdp);
                    }
                    CallState::Negotiating | CallState::Connected => self.on_offer(sdp).await,
                }
            }
            Envelope::Answer { sdp } => {
                if self.role != Role::Initiator {
                    debug!("Responder ignores incoming answer");
                    return;
                }
                match self.state {
                    CallState::Negotiating => match self.peer.set_remote_answer(sdp).await {
                        Ok(true) => self.transition(CallState::Connected),
                        Ok(false) => {}
                        Err(err) => {
                            error!("Error setting remote description: {err}");
                            self.events.emit_error(&err);
                        }
                    },
                    CallState::Connected => {
                        debug!("Already connected, ignoring duplicate answer");
                    }
                    _ => debug!("No call in negotiation, ignoring answer"),
                }
            }
            Envelope::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            Envelope::SessionCompleted => {
                info!("Session has been marked as completed");
                if self.state.is_active() {
                    self.finish_call(false).await;
                }
                self.events.emit_session_completed();
            }
            other @ (Envelope::EndSession | Envelope::Unknown) => {
                debug!("Ignoring {} envelope", other.label());
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        if self.peer.has_remote_description().await || !self.peer.has_connection() {
            info!("New offer for an already negotiated connection, recreating peer");
            if let Err(err) = self.peer.recreate().await {
                error!("Failed to recreate peer connection: {err}");
                self.events.emit_error(&err);
                return;
            }
            self.cancel_grace();
            self.release_screen_share();
            self.transition(CallState::Negotiating);
            if let Some(stream) = self.local_stream.clone() {
                if let Err(err) = self.peer.attach_local_tracks(&stream).await {
                    error!("Failed to re-attach local tracks: {err}");
                    self.events.emit_error(&err);
                    return;
                }
            }
        }

        if let Err(err) = self.peer.set_remote_offer(sdp).await {
            error!("Error handling SDP offer: {err}");
            self.events.emit_error(&err);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        // после конца звонка нужны только кандидаты к отложенному новому offer
        if self.state == CallState::Ended && self.pending_offer.is_none() {
            debug!("Call ended, ignoring stray ICE candidate");
            return;
        }
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!("Error adding ICE candidate: {e}");
        }
    }

    async fn on_transport_closed(&mut self, reason: Option<String>) {
        let err = CallError::Transport(reason.unwrap_or_else(|| "signaling closed".into()));
        warn!("Signaling transport lost: {err}");
        if self.state.is_active() {
            self.finish_call(false).await;
        }
        self.events.emit_error(&err);
    }

    /// События соединения; всё от неактуального поколения отбрасывается
    pub async fn handle_notice(&mut self, notice: PeerNotice) {
        if !self.peer.is_current(notice.generation) {
            debug!(
                generation = notice.generation,
                "Ignoring event from a torn down connection"
            );
            return;
        }
        match notice.event {
            PeerEvent::LocalCandidate(candidate) => {
                self.peer.relay_local_candidate(notice.generation, candidate);
            }
            PeerEvent::RemoteTrack(track) => {
                if self.peer.bind_remote_track(notice.generation, track.clone()) {
                    self.events.emit_remote_track(track);
                }
            }
            PeerEvent::StateChanged(st) => self.on_connection_state(notice.generation, st),
            PeerEvent::GraceExpired => {
                self.grace_task = None;
                if self.degraded {
                    self.events.emit_connection_failed();
                }
            }
        }
    }

    fn on_connection_state(&mut self, generation: u64, st: ConnectionState) {
        match st {
            ConnectionState::Connected => {
                self.cancel_grace();
                if self.degraded {
                    self.degraded = false;
                    self.events.emit_connection_recovered();
                }
                analyze_candidates(self.peer.local_candidates());
                if self.state == CallState::Negotiating {
                    self.transition(CallState::Connected);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if self.grace_task.is_some() {
                    debug!("Grace period already running");
                    return;
                }
                self.degraded = true;
                self.events.emit_connection_problem();
                info!("Grace period started, waiting {} s", self.grace_period.as_secs());
                let notices = self.notices.clone();
                let period = self.grace_period;
                self.grace_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(period).await;
                    let _ = notices.send(PeerNotice {
                        generation,
                        event: PeerEvent::GraceExpired,
                    });
                }));
            }
            other => debug!("Peer connection state: {:?}", other),
        }
    }

    fn cancel_grace(&mut self) {
        if let Some(handle) = self.grace_task.take() {
            debug!("Aborting pending grace period");
            handle.abort();
        }
    }

    /// Завершение звонка пользователем. Безопасно в любом состоянии:
    /// после него нет живых локальных треков и нет соединения.
    pub async fn end_call(&mut self) {
        // пока offer не отправлен, сессию завершать не с кем
        let announce = self.role == Role::Initiator
            && matches!(self.state, CallState::Negotiating | CallState::Connected);
        self.finish_call(announce).await;
    }

    async fn finish_call(&mut self, announce: bool) {
        // устройства освобождаются до любого await
        self.media.release(self.local_stream.take().as_deref());
        self.release_screen_share();
        self.cancel_grace();
        self.degraded = false;
        self.pending_offer = None;
        self.peer.teardown().await;

        if announce {
            self.signaling.send(Envelope::EndSession);
        }
        if self.state.is_active() {
            self.transition(CallState::Ended);
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        self.toggle(TrackKind::Audio, enabled)
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        self.toggle(TrackKind::Video, enabled)
    }

    fn toggle(&mut self, kind: TrackKind, enabled: bool) -> bool {
        let Some(stream) = &self.local_stream else {
            debug!("No local stream to toggle");
            return false;
        };
        let mut found = false;
        for track in stream.tracks_of(kind) {
            track.set_enabled(enabled);
            found = true;
        }
        if found {
            match kind {
                TrackKind::Audio => self.events.emit_audio_toggled(enabled),
                TrackKind::Video => self.events.emit_video_toggled(enabled),
            }
        }
        found
    }

    /// Подменяет трек камеры в соединении видео-треком `screen`.
    /// Повторный вызов заменяет предыдущую демонстрацию.
    pub async fn start_screen_share(&mut self, screen: Arc<LocalStream>) -> Result<()> {
        if !matches!(self.state, CallState::Negotiating | CallState::Connected) {
            return Err(CallError::NoConnection);
        }
        let Some(track) = screen.tracks_of(TrackKind::Video).next().cloned() else {
            return Err(MediaError::DeviceUnavailable("no screen video track".into()).into());
        };
        self.peer.replace_video_track(&track).await?;
        if let Some(previous) = self.screen_stream.replace(screen) {
            self.media.release(Some(previous.as_ref()));
        }
        info!(track = track.id(), "Screen sharing started");
        self.events.emit_screen_share_toggled(true);
        Ok(())
    }

    /// Возвращает в соединение трек камеры. `false`, если демонстрации не было.
    pub async fn stop_screen_share(&mut self) -> Result<bool> {
        let Some(screen) = self.screen_stream.take() else {
            return Ok(false);
        };
        self.media.release(Some(screen.as_ref()));
        let camera = self
            .local_stream
            .as_ref()
            .and_then(|s| s.tracks_of(TrackKind::Video).next().cloned());
        if let Some(camera) = camera {
            if self.peer.has_connection() {
                self.peer.replace_video_track(&camera).await?;
            }
        }
        info!("Screen sharing stopped");
        self.events.emit_screen_share_toggled(false);
        Ok(true)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_stream.is_some()
    }

    /// Останавливает демонстрацию без возврата камеры (соединения уже нет)
    fn release_screen_share(&mut self) {
        if let Some(screen) = self.screen_stream.take() {
            self.media.release(Some(screen.as_ref()));
            self.events.emit_screen_share_toggled(false);
        }
    }

    /// Уход из представления: звонок завершается, сигнальный канал закрывается
    pub async fn shutdown(&mut self) {
        self.end_call().await;
        self.signaling.close();
    }
}
