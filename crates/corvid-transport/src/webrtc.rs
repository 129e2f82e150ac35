//! WebRTC peer connection lifecycle.
//!
//! One bidirectional audio transceiver (Opus, 48kHz), an optional video
//! receive track, and one ordered reliable data channel. The answering side
//! gathers its ICE candidates into the answer SDP; remote candidates trickle
//! in through the signalling PATCH.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use corvid_core::{AudioFrame, Channels, SampleRate};

use crate::codec::{OpusDecoder, OpusEncoder, Packetizer};
use crate::{PeerMessage, TransportError};

/// Negotiated transport rate.
pub const TRANSPORT_RATE: SampleRate = SampleRate::Hz48000;

const OPUS_PAYLOAD_TYPE: u8 = 111;
const H264_PAYLOAD_TYPE: u8 = 102;
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);
const AUDIO_CHANNEL_CAPACITY: usize = 100;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    /// A `failed` connection closes the session after this grace.
    pub failed_close_grace: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        use corvid_config::constants::transport;
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            failed_close_grace: Duration::from_millis(transport::FAILED_CLOSE_GRACE_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRtcState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Trickle ICE candidate as it appears on the signalling surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Events surfaced to the owning session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    /// The connection is gone for good; the session should tear down.
    Closed { reason: String },
    /// Inbound data-channel payload (client → server is rare but legal).
    DataMessage(String),
}

/// One peer connection and its media plumbing.
pub struct WebRtcTransport {
    config: WebRtcConfig,
    state: Arc<RwLock<WebRtcState>>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    encoder: Option<Arc<OpusEncoder>>,
    packetizer: Mutex<Packetizer>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    audio_rx: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    audio_tx: mpsc::Sender<AudioFrame>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    local_candidates: Arc<RwLock<Vec<IceCandidate>>>,
}

impl WebRtcTransport {
    pub fn new(config: WebRtcConfig) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(32);

        Self {
            config,
            state: Arc::new(RwLock::new(WebRtcState::New)),
            peer_connection: None,
            audio_track: None,
            encoder: None,
            packetizer: Mutex::new(Packetizer::new(TRANSPORT_RATE)),
            data_channel: Arc::new(RwLock::new(None)),
            audio_rx: Mutex::new(Some(audio_rx)),
            audio_tx,
            event_rx: Mutex::new(Some(event_rx)),
            event_tx,
            local_candidates: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Decoded inbound audio at the transport rate. Take once.
    pub fn take_audio_rx(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.audio_rx.lock().take()
    }

    /// Lifecycle events. Take once.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.lock().take()
    }

    pub fn state(&self) -> WebRtcState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == WebRtcState::Connected
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.read().clone()
    }

    /// Media engine with the codec policy: Opus for audio, H.264
    /// constrained-baseline for video. Offers with pruned VP8/VP9/AV1
    /// payload types negotiate cleanly against this set.
    fn create_api(&self) -> Result<API, TransportError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "audio/opus".to_string(),
                        clock_rate: TRANSPORT_RATE.as_u32(),
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: OPUS_PAYLOAD_TYPE,
                    stats_id: String::new(),
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/H264".to_string(),
                        clock_rate: 90_000,
                        channels: 0,
                        sdp_fmtp_line:
                            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                                .to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: H264_PAYLOAD_TYPE,
                    stats_id: String::new(),
                },
                RTPCodecType::Video,
            )
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        {
            use corvid_config::constants::transport::{
                ICE_DISCONNECTED_TIMEOUT_SECS, ICE_FAILED_TIMEOUT_SECS,
                ICE_KEEPALIVE_INTERVAL_SECS,
            };
            setting_engine.set_ice_timeouts(
                Some(Duration::from_secs(ICE_DISCONNECTED_TIMEOUT_SECS)),
                Some(Duration::from_secs(ICE_FAILED_TIMEOUT_SECS)),
                Some(Duration::from_secs(ICE_KEEPALIVE_INTERVAL_SECS)),
            );
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Accept a peer's offer and produce the answer, with local ICE
    /// candidates gathered into the SDP.
    pub async fn accept(&mut self, offer_sdp: &str) -> Result<String, TransportError> {
        *self.state.write() = WebRtcState::Connecting;

        let api = self.create_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        );
        self.peer_connection = Some(pc.clone());

        self.install_state_handler(&pc);
        self.install_track_handler(&pc);
        self.install_data_channel_handlers(&pc).await?;

        // Queue local candidates; they flush into the answer SDP once
        // gathering completes below.
        let local_candidates = self.local_candidates.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let local_candidates = local_candidates.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    if let Ok(json) = c.to_json() {
                        local_candidates.write().push(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        });
                    }
                } else {
                    tracing::debug!("ICE gathering complete (end-of-candidates)");
                }
            })
        }));

        let (gather_tx, gather_rx) = oneshot::channel::<()>();
        let gather_tx = Arc::new(Mutex::new(Some(gather_tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            if state == RTCIceGathererState::Complete {
                if let Some(tx) = gather_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
            Box::pin(async {})
        }));

        // Outgoing audio track.
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: TRANSPORT_RATE.as_u32(),
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            "corvid".to_string(),
        ));
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Media(format!("add audio track: {}", e)))?;
        self.audio_track = Some(audio_track);
        self.encoder = Some(Arc::new(OpusEncoder::new(TRANSPORT_RATE)?));

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TransportError::ConnectionFailed(format!("bad offer: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bad offer: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        // Fail closed when negotiation stripped our only audio codec.
        if !answer.sdp.contains("opus") {
            return Err(TransportError::UnsupportedCodec(
                "no opus in negotiated answer".into(),
            ));
        }

        pc.set_local_description(answer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        match tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_rx).await {
            Ok(_) => {}
            Err(_) => tracing::warn!(
                candidates = self.local_candidates.read().len(),
                "ICE gathering timed out, answering with partial candidates"
            ),
        }

        let final_sdp = pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| TransportError::Internal("no local description".into()))?;

        tracing::info!(
            candidates = self.local_candidates.read().len(),
            "answer ready"
        );
        Ok(final_sdp)
    }

    /// Add a remote candidate received via signalling PATCH.
    pub async fn add_remote_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        let pc = self
            .peer_connection
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionFailed("no peer connection".into()))?;

        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("add candidate: {}", e)))?;

        tracing::debug!(candidate = %candidate.candidate, "added remote ICE candidate");
        Ok(())
    }

    fn install_state_handler(&self, pc: &Arc<RTCPeerConnection>) {
        let state_ref = self.state.clone();
        let event_tx = self.event_tx.clone();
        let grace = self.config.failed_close_grace;

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let new_state = match s {
                RTCPeerConnectionState::Connected => WebRtcState::Connected,
                RTCPeerConnectionState::Disconnected => WebRtcState::Disconnected,
                RTCPeerConnectionState::Failed => WebRtcState::Failed,
                RTCPeerConnectionState::Closed => WebRtcState::Closed,
                _ => return Box::pin(async {}),
            };
            *state_ref.write() = new_state;

            let state_ref = state_ref.clone();
            let event_tx = event_tx.clone();
            Box::pin(async move {
                match new_state {
                    WebRtcState::Connected => {
                        let _ = event_tx.send(TransportEvent::Connected).await;
                    }
                    WebRtcState::Closed => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: "peer closed".into(),
                            })
                            .await;
                    }
                    WebRtcState::Failed => {
                        // Bounded grace before the session is torn down.
                        tokio::time::sleep(grace).await;
                        if *state_ref.read() == WebRtcState::Failed {
                            let _ = event_tx
                                .send(TransportEvent::Closed {
                                    reason: "ice failed".into(),
                                })
                                .await;
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    fn install_track_handler(&self, pc: &Arc<RTCPeerConnection>) {
        let audio_tx = self.audio_tx.clone();

        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            if track.kind() != RTPCodecType::Audio {
                // Video frames are decoded lazily on demand by the vision
                // tool; the transport does not pull them.
                tracing::debug!(kind = ?track.kind(), "ignoring non-audio track");
                return Box::pin(async {});
            }

            let audio_tx = audio_tx.clone();
            Box::pin(async move {
                let decoder = match OpusDecoder::new(TRANSPORT_RATE) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        tracing::error!(error = %e, "decoder init failed, dropping track");
                        return;
                    }
                };

                let mut sequence: u64 = 0;
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            if packet.payload.is_empty() {
                                continue;
                            }
                            let samples = match decoder.decode(&packet.payload) {
                                Ok(samples) => samples,
                                Err(e) => {
                                    tracing::warn!(error = %e, "opus decode error, concealing");
                                    match decoder.decode_plc() {
                                        Ok(samples) => samples,
                                        Err(_) => continue,
                                    }
                                }
                            };

                            let frame = AudioFrame::new(
                                samples,
                                TRANSPORT_RATE,
                                Channels::Mono,
                                sequence,
                            );
                            sequence += 1;

                            // Audio ingress blocks on backpressure rather
                            // than dropping voice.
                            if audio_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "audio track read ended");
                            break;
                        }
                    }
                }
            })
        }));
    }

    async fn install_data_channel_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<(), TransportError> {
        // Our ordered, reliable metadata channel.
        let channel = pc
            .create_data_channel("events", None)
            .await
            .map_err(|e| TransportError::DataChannel(e.to_string()))?;
        *self.data_channel.write() = Some(channel);

        // Adopt inbound messages from any channel the peer created.
        let event_tx = self.event_tx.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                let label = channel.label().to_string();
                tracing::debug!(label = %label, "peer data channel");
                channel.on_message(Box::new(move |msg| {
                    let event_tx = event_tx.clone();
                    Box::pin(async move {
                        if let Ok(text) = std::str::from_utf8(&msg.data) {
                            let _ = event_tx
                                .send(TransportEvent::DataMessage(text.to_string()))
                                .await;
                        }
                    })
                }));
            })
        }));

        Ok(())
    }

    /// Send synthesized audio to the peer. Expects mono at the transport
    /// rate; the caller resamples.
    pub async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        let (track, encoder) = match (&self.audio_track, &self.encoder) {
            (Some(track), Some(encoder)) => (track.clone(), encoder.clone()),
            _ => return Err(TransportError::SessionClosed),
        };

        let packets = self.packetizer.lock().push(&frame.samples);
        for packet in packets {
            let encoded = encoder.encode(&packet.samples)?;
            track
                .write_sample(&Sample {
                    data: encoded.into(),
                    duration: packet.duration,
                    ..Default::default()
                })
                .await
                .map_err(|e| TransportError::Media(format!("write sample: {}", e)))?;
        }
        Ok(())
    }

    /// Flush the packetizer remainder at turn end.
    pub async fn flush_audio(&self) -> Result<(), TransportError> {
        let (track, encoder) = match (&self.audio_track, &self.encoder) {
            (Some(track), Some(encoder)) => (track.clone(), encoder.clone()),
            _ => return Ok(()),
        };

        let frame = self.packetizer.lock().flush();
        if let Some(frame) = frame {
            let encoded = encoder.encode(&frame.samples)?;
            track
                .write_sample(&Sample {
                    data: encoded.into(),
                    duration: frame.duration,
                    ..Default::default()
                })
                .await
                .map_err(|e| TransportError::Media(format!("write sample: {}", e)))?;
        }
        Ok(())
    }

    /// Send one JSON-lines message on the data channel.
    pub async fn send_message(&self, message: &PeerMessage) -> Result<(), TransportError> {
        let channel = self
            .data_channel
            .read()
            .clone()
            .ok_or(TransportError::SessionClosed)?;

        channel
            .send_text(message.to_line())
            .await
            .map_err(|e| TransportError::DataChannel(e.to_string()))?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(pc) = &self.peer_connection {
            pc.close()
                .await
                .map_err(|e| TransportError::Internal(e.to_string()))?;
        }
        *self.state.write() = WebRtcState::Closed;
        self.peer_connection = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transport_state() {
        let transport = WebRtcTransport::new(WebRtcConfig::default());
        assert_eq!(transport.state(), WebRtcState::New);
        assert!(!transport.is_connected());
        assert!(transport.local_candidates().is_empty());
    }

    #[test]
    fn test_receivers_taken_once() {
        let transport = WebRtcTransport::new(WebRtcConfig::default());
        assert!(transport.take_audio_rx().is_some());
        assert!(transport.take_audio_rx().is_none());
        assert!(transport.take_event_rx().is_some());
        assert!(transport.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_accept_rejects_garbage_offer() {
        let mut transport = WebRtcTransport::new(WebRtcConfig::default());
        let result = transport.accept("not an sdp").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_before_accept_fails() {
        let transport = WebRtcTransport::new(WebRtcConfig::default());
        let frame = AudioFrame::new(vec![0.0; 960], TRANSPORT_RATE, Channels::Mono, 0);
        assert!(matches!(
            transport.send_audio(&frame).await,
            Err(TransportError::SessionClosed)
        ));
        assert!(matches!(
            transport
                .send_message(&PeerMessage::System {
                    message: "hi".into()
                })
                .await,
            Err(TransportError::SessionClosed)
        ));
    }

    #[test]
    fn test_ice_candidate_serde() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&candidate).unwrap();
        let parsed: IceCandidate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.candidate, candidate.candidate);
        assert_eq!(parsed.sdp_mline_index, Some(0));
    }
}
