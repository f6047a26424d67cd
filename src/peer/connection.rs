use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::media::{LocalStream, LocalTrack};
use crate::peer::ice::CandidateBuffer;
use crate::peer::types::{
    IceCandidate, PeerEvent, PeerNotice, RemoteTrack, Role, SessionDescription,
};
use crate::signaling::{Envelope, SignalingChannel};

/// Операции над одним peer connection, которые нужны переговорам
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    /// Подмена трека у видео-отправителя без пересогласования
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Создаёт соединение и подписывает `observer` на его события
/// (локальные кандидаты, удалённые треки, состояние соединения).
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, observer: PeerObserver) -> Result<Arc<dyn PeerConnection>>;
}

/// Канал событий от одного конкретного соединения
#[derive(Clone, Debug)]
pub struct PeerObserver {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerObserver {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerNotice>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerNotice {
            generation: self.generation,
            event,
        });
    }
}

struct ActivePeer {
    generation: u64,
    pc: Arc<dyn PeerConnection>,
}

/// Единственный владелец текущего peer connection.
///
/// Одновременно существует не больше одного соединения; каждое новое
/// получает свой номер поколения, и события от старых поколений
/// отбрасываются.
pub struct PeerConnectionManager {
    role: Role,
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<SignalingChannel>,
    notices: mpsc::UnboundedSender<PeerNotice>,
    current: Option<ActivePeer>,
    last_generation: u64,
    buffer: CandidateBuffer,
    local_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerConnectionManager {
    pub fn new(
        role: Role,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<SignalingChannel>,
        notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        Self {
            role,
            factory,
            signaling,
            notices,
            current: None,
            last_generation: 0,
            buffer: CandidateBuffer::new(),
            local_candidates: Vec::new(),
            remote_tracks: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_connection(&self) -> bool {
        self.current.is_some()
    }

    /// Поколение текущего соединения
    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|p| p.generation)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == Some(generation)
    }

    pub fn pending_candidates(&self) -> usize {
        self.buffer.len()
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub async fn has_remote_description(&self) -> bool {
        match &self.current {
            Some(p) => p.pc.remote_description().await.is_some(),
            None => false,
        }
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        match &self.current {
            Some(p) => p.pc.remote_description().await,
            None => None,
        }
    }

    fn active(&self) -> Result<Arc<dyn PeerConnection>> {
        self.current
            .as_ref()
            .map(|p| p.pc.clone())
            .ok_or(CallError::NoConnection)
    }

    /// Создаёт новое соединение. Старое, если осталось, сначала закрывается.
    pub async fn create(&mut self) -> Result<u64> {
        if self.current.is_some() {
            warn!("create() with a live connection, tearing the old one down first");
            self.close_current().await;
        }

        let generation = self.last_generation + 1;
        let observer = PeerObserver::new(generation, self.notices.clone());
        let pc = self.factory.create(observer).await?;
        self.last_generation = generation;
        self.current = Some(ActivePeer { generation, pc });
        info!(generation, role = %self.role, "Peer connection created");
        Ok(generation)
    }

    /// Ответная сторона: offer → remote description → отложенные кандидаты →
    /// answer → local description → отправка answer.
    pub async fn set_remote_offer(&mut self, sdp: String) -> Result<()> {
        if self.role != Role::Responder {
            return Err(CallError::InvalidRole {
                op: "set_remote_offer",
                role: self.role,
            });
        }
        let pc = self.active()?;

        debug!("Setting remote description (offer)...");
        pc.set_remote_description(SessionDescription::offer(sdp))
            .await
            .map_err(|e| CallError::negotiation("set_remote_description", e))?;
        info!("Remote description set (offer)");

        self.buffer.drain_into(pc.as_ref()).await?;

        debug!("Creating answer...");
        let answer = pc
            .create_answer()
            .await
            .map_err(|e| CallError::negotiation("create_answer", e))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::negotiation("set_local_description", e))?;

        self.signaling.send(Envelope::Answer { sdp: answer.sdp });
        info!("Sent SDP answer");
        Ok(())
    }

    /// Инициатор: применяет answer, если remote description ещё не задан.
    /// Возвращает `false`, если answer проигнорирован как дубликат.
    pub async fn set_remote_answer(&mut self, sdp: String) -> Result<bool> {
        if self.role != Role::Initiator {
            return Err(CallError::InvalidRole {
                op: "set_remote_answer",
                role: self.role,
            });
        }
        let pc = self.active()?;

        if pc.remote_description().await.is_some() {
            debug!("Remote description already set, ignoring duplicate answer");
            return Ok(false);
        }

        pc.set_remote_description(SessionDescription::answer(sdp))
            .await
            .map_err(|e| CallError::negotiation("set_remote_description", e))?;
        info!("Remote description set (answer)");

        self.buffer.drain_into(pc.as_ref()).await?;
        Ok(true)
    }

    /// Применяет удалённый кандидат сразу, если есть remote description,
    /// иначе кладёт его в очередь.
    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        dump_candidate("REMOTE", &candidate);
        let pc = match &self.current {
            Some(p) => p.pc.clone(),
            None => {
                debug!("No peer connection yet, queuing candidate");
                self.buffer.enqueue(candidate);
                return Ok(());
            }
        };

        if pc.remote_description().await.is_none() {
            debug!("Remote description not set yet, queuing candidate");
            self.buffer.enqueue(candidate);
            return Ok(());
        }

        pc.add_ice_candidate(candidate)
            .await
            .map_err(|e| CallError::Candidate(e.to_string()))?;
        debug!("Added remote ICE candidate");
        Ok(())
    }

    /// Добавляет все треки потока; инициатор сразу же создаёт и отправляет offer.
    pub async fn attach_local_tracks(&mut self, stream: &LocalStream) -> Result<()> {
        let pc = self.active()?;
        for track in stream.tracks() {
            pc.add_track(track).await?;
            debug!(track = track.id(), "Local track attached");
        }

        if self.role == Role::Initiator {
            debug!("Creating offer...");
            let offer = pc
                .create_offer()
                .await
                .map_err(|e| CallError::negotiation("create_offer", e))?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(|e| CallError::negotiation("set_local_description", e))?;
            self.signaling.send(Envelope::Offer { sdp: offer.sdp });
            info!("Sent SDP offer");
        }
        Ok(())
    }

    pub async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        let pc = self.active()?;
        pc.replace_video_track(track)
            .await
            .map_err(|e| CallError::negotiation("replace_track", e))?;
        debug!(track = track.id(), "Video sender track replaced");
        Ok(())
    }

    /// Локальный кандидат текущего соединения уходит в сигнальный канал сразу.
    /// Если канал закрыт, кандидат отбрасывается: локальные кандидаты не копятся.
    pub fn relay_local_candidate(&mut self, generation: u64, candidate: IceCandidate) -> bool {
        if !self.is_current(generation) {
            debug!(generation, "Dropping local candidate of a stale connection");
            return false;
        }
        dump_candidate("LOCAL", &candidate);
        self.local_candidates.push(candidate.clone());
        if !self.signaling.is_open() {
            debug!("Signaling channel not open, dropping local candidate");
            return false;
        }
        self.signaling.send(Envelope::IceCandidate { candidate })
    }

    /// Привязывает удалённый трек к текущему соединению
    pub fn bind_remote_track(&mut self, generation: u64, track: RemoteTrack) -> bool {
        if !self.is_current(generation) {
            debug!(generation, "Dropping remote track of a stale connection");
            return false;
        }
        info!(track = %track.id, stream = %track.stream_id, "Received remote track");
        self.remote_tracks.push(track);
        true
    }

    async fn close_current(&mut self) {
        if let Some(active) = self.current.take() {
            if let Err(e) = active.pc.close().await {
                warn!("Failed to close peer connection: {e}");
            }
            info!(generation = active.generation, "Peer connection closed");
        }
        self.local_candidates.clear();
        self.remote_tracks.clear();
    }

    /// Закрывает соединение и сбрасывает очередь кандидатов.
    /// Без соединения ничего не делает.
    pub async fn teardown(&mut self) {
        self.close_current().await;
        self.buffer.clear();
    }

    /// Пересоздаёт соединение для нового offer: закрывает старое, но
    /// сохраняет кандидаты, пришедшие для нового.
    pub async fn recreate(&mut self) -> Result<u64> {
        self.close_current().await;
        self.create().await
    }
}
