use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::{
    api::APIBuilder,
    ice_transport::{
        ice_candidate::RTCIceCandidate, ice_gatherer_state::RTCIceGathererState,
        ice_server::RTCIceServer,
    },
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

use crate::config::{ServerConfig, ServerKind};
use crate::error::{CallError, Result};
use crate::peer::connection::PeerConnection;
use crate::peer::state::ICE_CHECK_TIMEOUT;
use crate::peer::types::IceCandidate;
use crate::utils::add_ice_url_scheme;

/// Удалённые кандидаты, полученные до установки remote description.
///
/// Порядок прихода сохраняется; очередь опустошается ровно один раз за
/// соединение, сразу после успешного `set_remote_description`.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

/// Итог применения отложенных кандидатов
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
        debug!("Queued remote candidate, pending={}", self.pending.len());
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Применяет все отложенные кандидаты в порядке FIFO и очищает очередь.
    /// Ошибка одного кандидата логируется и не прерывает остальные.
    ///
    /// Вызывать до установки remote description нельзя: очередь не трогается
    /// и возвращается ошибка.
    pub async fn drain_into(&mut self, pc: &dyn PeerConnection) -> Result<DrainReport> {
        if pc.remote_description().await.is_none() {
            return Err(CallError::negotiation(
                "drain_candidates",
                "remote description is not set",
            ));
        }

        let mut report = DrainReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            debug!("Applying pending candidate: {}", candidate.candidate);
            match pc.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!("Failed to apply pending candidate: {e}");
                    report.failed += 1;
                }
            }
        }
        if report.applied + report.failed > 0 {
            info!(
                "Drained candidate buffer: {} applied, {} failed",
                report.applied, report.failed
            );
        }
        Ok(report)
    }
}

/// Разбивка кандидатов по типам
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 && summary.srflx == 0 && summary.host > 0 {
        warn!("Only host candidates gathered; connection through NAT may fail");
    }
    summary
}

/// Проверяет, что ICE сервер реально выдаёт кандидатов нужного типа:
/// `srflx` для STUN, `relay` для TURN.
pub async fn check_ice_server(config: &ServerConfig) -> Result<bool> {
    config.validate()?;
    let url = add_ice_url_scheme(config);
    debug!("Probing ICE server '{}' -> '{}'", config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
    let result = check_via_gathering(&pc, config.r#type).await;
    if let Err(e) = pc.close().await {
        debug!("Failed to close check connection: {e}");
    }
    result
}

async fn check_via_gathering(pc: &Arc<RTCPeerConnection>, kind: ServerKind) -> Result<bool> {
    let wanted = match kind {
        ServerKind::Stun => "typ srflx",
        ServerKind::Turn => "typ relay",
    };

    let (found_tx, mut found_rx) = mpsc::channel::<bool>(10);
    let done_tx = found_tx.clone();

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = found_tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(json) if json.candidate.contains(wanted) => {
                    debug!("Check found matching candidate: {}", json.candidate);
                    let _ = tx.send(true).await;
                }
                Ok(json) => debug!("Check ignoring candidate: {}", json.candidate),
                Err(e) => warn!("Failed to get candidate JSON: {e}"),
            }
        })
    }));

    // Сбор закончился без подходящего кандидата
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let tx = done_tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                let _ = tx.send(false).await;
            }
        })
    }));

    // data channel нужен только чтобы запустить сбор кандидатов
    pc.create_data_channel("ice-check", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    match timeout(ICE_CHECK_TIMEOUT, found_rx.recv()).await {
        Ok(Some(found)) => Ok(found),
        Ok(None) => Ok(false),
        Err(_) => {
            info!("Timeout waiting for {wanted} candidate");
            Ok(false)
        }
    }
}
