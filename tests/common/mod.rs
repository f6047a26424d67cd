#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use mentorcall::error::{CallError, MediaError, Result};
use mentorcall::logger::EventEmitter;
use mentorcall::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaSessionController, SampleDevices,
};
use mentorcall::peer::connection::{PeerConnection, PeerConnectionFactory, PeerObserver};
use mentorcall::peer::negotiation::Negotiator;
use mentorcall::peer::types::{CallEvent, IceCandidate, PeerNotice, Role, SessionDescription};
use mentorcall::session::SessionId;
use mentorcall::signaling::{ChannelEvents, Envelope, MemoryRemote, SignalingChannel};

/// Соединение без сети: запоминает всё, что с ним делали
pub struct FakePeer {
    pub generation: u64,
    pub remote: Mutex<Option<SessionDescription>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub applied: Mutex<Vec<IceCandidate>>,
    pub tracks: Mutex<Vec<String>>,
    /// Треки, поставленные в видео-отправитель через `replace_video_track`
    pub replaced: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    /// Кандидаты с этим текстом отклоняются
    pub reject_candidate: Option<String>,
}

impl FakePeer {
    fn new(generation: u64, reject_candidate: Option<String>) -> Self {
        Self {
            generation,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reject_candidate,
        }
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote.lock().unwrap().as_ref().map(|d| d.sdp.clone())
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn replaced(&self) -> Vec<String> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-{}", self.generation)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote.lock().unwrap().is_none() {
            return Err(CallError::negotiation("create_answer", "no remote offer"));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.generation)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp.is_empty() {
            return Err(CallError::negotiation("set_remote_description", "empty sdp"));
        }
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.reject_candidate.as_deref() == Some(candidate.candidate.as_str()) {
            return Err(CallError::Candidate("rejected".into()));
        }
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        self.replaced.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub observers: Mutex<Vec<PeerObserver>>,
    pub fail: AtomicBool,
    pub reject_candidate: Option<String>,
}

impl FakeFactory {
    pub fn rejecting(candidate: &str) -> Self {
        Self {
            reject_candidate: Some(candidate.to_string()),
            ..Default::default()
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn live(&self) -> usize {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_closed())
            .count()
    }

    pub fn peer(&self, i: usize) -> Arc<FakePeer> {
        self.peers.lock().unwrap()[i].clone()
    }

    pub fn observer(&self, i: usize) -> PeerObserver {
        self.observers.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self, observer: PeerObserver) -> Result<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::negotiation("create_peer", "factory failure"));
        }
        let peer = Arc::new(FakePeer::new(
            observer.generation(),
            self.reject_candidate.clone(),
        ));
        self.peers.lock().unwrap().push(peer.clone());
        self.observers.lock().unwrap().push(observer);
        let pc: Arc<dyn PeerConnection> = peer;
        Ok(pc)
    }
}

/// Пользователь запретил доступ к камере и микрофону
pub struct DeniedDevices;

#[async_trait]
impl MediaDevices for DeniedDevices {
    async fn open(&self, _constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        Err(MediaError::PermissionDenied)
    }
}

/// Устройства, которые отвечают с задержкой (пользователь думает над доступом)
pub struct SlowDevices {
    pub delay: Duration,
    pub opened: Arc<AtomicBool>,
}

impl SlowDevices {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            opened: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl MediaDevices for SlowDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        tokio::time::sleep(self.delay).await;
        self.opened.store(true, Ordering::SeqCst);
        SampleDevices::default().open(constraints).await
    }
}

pub fn session() -> SessionId {
    SessionId::new("42").unwrap()
}

pub fn candidate(text: &str) -> IceCandidate {
    let mut c = IceCandidate::new(text);
    c.sdp_mid = Some("0".into());
    c.sdp_mline_index = Some(0);
    c
}

/// Машина состояний с фейковым соединением и каналом в памяти.
/// Все события подаются вручную через `pump`.
pub struct Harness {
    pub negotiator: Negotiator,
    pub factory: Arc<FakeFactory>,
    pub remote: MemoryRemote,
    channel_events: ChannelEvents,
    notices: mpsc::UnboundedReceiver<PeerNotice>,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl Harness {
    pub fn new(role: Role) -> Self {
        Self::build(role, Arc::new(SampleDevices::default()), FakeFactory::default())
    }

    pub fn with_devices(role: Role, devices: Arc<dyn MediaDevices>) -> Self {
        Self::build(role, devices, FakeFactory::default())
    }

    pub fn with_factory(role: Role, factory: FakeFactory) -> Self {
        Self::build(role, Arc::new(SampleDevices::default()), factory)
    }

    fn build(role: Role, devices: Arc<dyn MediaDevices>, factory: FakeFactory) -> Self {
        let (channel, channel_events, remote) = SignalingChannel::in_memory(session());
        let factory = Arc::new(factory);
        let (emitter, events) = EventEmitter::new();
        let (negotiator, notices) = Negotiator::new(
            role,
            Arc::new(channel),
            MediaSessionController::new(devices),
            factory.clone(),
            emitter,
            Duration::from_secs(10),
        );
        Self {
            negotiator,
            factory,
            remote,
            channel_events,
            notices,
            events,
        }
    }

    /// Обрабатывает всё, что накопилось в очередях канала и соединений
    pub async fn pump(&mut self) {
        loop {
            if let Ok(event) = self.channel_events.try_recv() {
                self.negotiator.handle_channel_event(event).await;
                continue;
            }
            if let Ok(notice) = self.notices.try_recv() {
                self.negotiator.handle_notice(notice).await;
                continue;
            }
            break;
        }
    }

    pub async fn deliver(&mut self, env: Envelope) {
        self.remote.deliver(env);
        self.pump().await;
    }

    pub fn sent(&mut self) -> Vec<Envelope> {
        self.remote.sent()
    }

    pub fn events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = self.events.try_recv() {
            out.push(evt);
        }
        out
    }
}
