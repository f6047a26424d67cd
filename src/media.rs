use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{MediaError, Result};
use crate::peer::types::TrackKind;
use crate::utils::random_id;

/// Локальный трек захвата (камера или микрофон).
///
/// Приложение пишет в него уже закодированные кадры через `write_sample`;
/// выключенный или остановленный трек кадры молча отбрасывает.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (mime, label) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let id = format!("{label}-{}", random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Останавливает трек; возвращает `true`, если он был живым
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

/// Локальный медиапоток: набор треков одного захвата
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(kinds: &[TrackKind]) -> Self {
        let id = format!("stream-{}", random_id());
        let tracks = kinds
            .iter()
            .map(|kind| Arc::new(LocalTrack::new(*kind, &id)))
            .collect();
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Останавливает все треки, возвращает число реально остановленных
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Источник устройств захвата
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Устройства, кадры для которых поставляет само приложение
/// (энкодер камеры, файл, синтетический источник).
#[derive(Debug, Clone, Copy)]
pub struct SampleDevices {
    pub has_camera: bool,
    pub has_microphone: bool,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self {
            has_camera: true,
            has_microphone: true,
        }
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if constraints.video && !self.has_camera {
            return Err(MediaError::DeviceUnavailable("no camera".into()));
        }
        if constraints.audio && !self.has_microphone {
            return Err(MediaError::DeviceUnavailable("no microphone".into()));
        }
        let mut kinds = Vec::with_capacity(2);
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        if kinds.is_empty() {
            return Err(MediaError::DeviceUnavailable("nothing requested".into()));
        }
        Ok(LocalStream::new(&kinds))
    }
}

pub struct MediaRequest {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
}

impl MediaRequest {
    pub async fn acquire(self) -> Result<Arc<LocalStream>, MediaError> {
        let stream = self.devices.open(self.constraints).await?;
        info!(
            stream = stream.id(),
            tracks = stream.tracks().len(),
            "Local media acquired"
        );
        Ok(Arc::new(stream))
    }
}

/// Захват и освобождение локальных устройств
pub struct MediaSessionController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
}

impl MediaSessionController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            constraints: MediaConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Запрос на захват, не привязанный к контроллеру: его future можно
    /// бросить, если звонок отменили, пока пользователь думает над доступом.
    pub fn request(&self) -> MediaRequest {
        MediaRequest {
            devices: self.devices.clone(),
            constraints: self.constraints,
        }
    }

    /// Запрашивает камеру и микрофон
    pub async fn acquire(&self) -> Result<Arc<LocalStream>, MediaError> {
        self.request().acquire().await
    }

    /// Останавливает все треки потока. `None` или уже освобождённый поток допустимы.
    pub fn release(&self, stream: Option<&LocalStream>) {
        let Some(stream) = stream else {
            return;
        };
        let stopped = stream.stop_all();
        if stopped > 0 {
            info!(stream = stream.id(), stopped, "Local media released");
        } else {
            debug!(stream = stream.id(), "Local media already released");
        }
    }
}
