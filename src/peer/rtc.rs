//! Бэкенд на webrtc-rs: реальный `RTCPeerConnection` за трейтом `PeerConnection`.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{CallConfig, ServerConfig, DEFAULT_ICE_SERVERS};
use crate::error::{CallError, Result};
use crate::logger::dump_selected_pair;
use crate::media::LocalTrack;
use crate::peer::connection::{PeerConnection, PeerConnectionFactory, PeerObserver};
use crate::peer::types::{
    ConnectionState, IceCandidate, PeerEvent, RemoteTrack, SdpKind, SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;

/// Создаёт webrtc соединения с ICE серверами из конфига
pub struct RtcPeerFactory {
    ice_servers: Vec<ServerConfig>,
    ice_candidate_pool_size: u8,
}

impl RtcPeerFactory {
    /// Без своих серверов используется STUN по умолчанию
    pub fn new(config: &CallConfig) -> Self {
        let ice_servers = if config.ice_servers.is_empty() {
            warn!("No ICE servers configured, using defaults");
            DEFAULT_ICE_SERVERS.clone()
        } else {
            config.ice_servers.clone()
        };
        Self {
            ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }

    /// Создает конфигурацию для peer connection
    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: get_user_ice_servers(&self.ice_servers),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// Перевод конфигурации серверов в формат webrtc
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self, observer: PeerObserver) -> Result<Arc<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);

        // Локальные кандидаты (Trickle-ICE)
        let obs = observer.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let obs = obs.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => obs.notify(PeerEvent::LocalCandidate(IceCandidate::from(init))),
                        Err(e) => warn!("Failed to serialize local candidate: {e}"),
                    },
                    // None означает конец сбора
                    None => debug!("ICE candidate gathering completed"),
                }
            })
        }));

        let obs = observer.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _tr: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                obs.notify(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(track),
                }));
                Box::pin(async {})
            },
        ));

        let obs = observer;
        let weak: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {:?}", st);
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            obs.notify(PeerEvent::StateChanged(ConnectionState::from(st)));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeer { pc }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        _ => SdpKind::Answer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(from_rtc(self.pc.create_offer(None).await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(from_rtc(self.pc.create_answer(None).await?))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.map(from_rtc)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self.pc.add_track(track.rtc_track()).await?;
        // RTCP нужно вычитывать, иначе интерсепторы не работают
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let is_video = match sender.track().await {
                Some(current) => current.kind() == RTPCodecType::Video,
                None => false,
            };
            if is_video {
                sender.replace_track(Some(track.rtc_track())).await?;
                return Ok(());
            }
        }
        Err(CallError::negotiation("replace_track", "no video sender"))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerKind;

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = vec![
            ServerConfig {
                id: "s".into(),
                r#type: ServerKind::Stun,
                url: "stun.example.org:3478".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "t".into(),
                r#type: ServerKind::Turn,
                url: "turn.example.org:3478".into(),
                username: Some("user".into()),
                credential: Some("pass".into()),
            },
        ];
        let rtc = get_user_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(rtc[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc[1].username, "user");
        assert_eq!(rtc[1].credential, "pass");
    }

    #[test]
    fn empty_server_list_falls_back_to_default_stun() {
        let config = CallConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        let rtc = RtcPeerFactory::new(&config).rtc_config();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(
            rtc.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
        assert_eq!(rtc.ice_candidate_pool_size, config.ice_candidate_pool_size);
    }
}
