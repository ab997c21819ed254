//! [`PeerConnector`] on the `webrtc` crate.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ConnectionState, DataChannel, LocalCandidate, PeerConnection, PeerConnector, PeerError,
    PeerObserver, RemoteCandidate, SdpKind, SessionDescription,
};

/// One STUN/TURN server.
#[derive(Debug, Clone, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Settings for the WebRTC stack.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
    /// Public address advertised for host candidates. When set, the UDP port
    /// range applies; otherwise the interface filter does.
    pub external_ip: Option<String>,
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Interface name prefixes allowed for gathering.
    pub interface_prefixes: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            external_ip: None,
            udp_port_min: 50000,
            udp_port_max: 50100,
            interface_prefixes: ["en", "eth", "wlan", "br-"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Creates `webrtc` peer connections sharing one API instance.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    /// Build the WebRTC API.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting engine rejects the configuration.
    pub fn new(config: &RtcConfig) -> Result<Self, PeerError> {
        let mut settings = SettingEngine::default();

        match &config.external_ip {
            Some(ip) => {
                settings.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
                let ports = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                    .map_err(|e| PeerError::Create(e.to_string()))?;
                settings.set_udp_network(UDPNetwork::Ephemeral(ports));
            }
            None => {
                let prefixes = config.interface_prefixes.clone();
                settings.set_interface_filter(Box::new(move |name: &str| {
                    prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
                }));
            }
        }
        settings.set_lite(false);
        settings.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);

        let api = APIBuilder::new().with_setting_engine(settings).build();
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        info!(
            external_ip = ?config.external_ip,
            ice_servers = config.ice_servers.len(),
            "WebRTC connector ready"
        );
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| PeerError::Create(e.to_string()))?;

        Ok(Arc::new(WebRtcPeer::new(Arc::new(pc))))
    }
}

type ObserverSlot = Arc<RwLock<Option<Arc<dyn PeerObserver>>>>;

fn observer(slot: &ObserverSlot) -> Option<Arc<dyn PeerObserver>> {
    slot.read().clone()
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    observer: ObserverSlot,
}

impl WebRtcPeer {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let slot: ObserverSlot = Arc::new(RwLock::new(None));

        let candidates = slot.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let slot = candidates.clone();
            Box::pin(async move {
                let Some(observer) = observer(&slot) else {
                    return;
                };
                match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => observer.on_ice_candidate(Some(LocalCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Some(Err(e)) => debug!(error = %e, "Unserializable local candidate"),
                    None => observer.on_ice_candidate(None),
                }
            })
        }));

        let states = slot.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let slot = states.clone();
            Box::pin(async move {
                let state = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                if let Some(observer) = observer(&slot) {
                    observer.on_connection_state_change(state);
                }
            })
        }));

        let channels = slot.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = channels.clone();
            Box::pin(async move {
                watch_channel(&dc, &slot);
                if let Some(observer) = observer(&slot) {
                    observer.on_data_channel(Arc::new(WebRtcDataChannel { dc }));
                }
            })
        }));

        Self { pc, observer: slot }
    }
}

/// Forward a data channel's events to the observer.
fn watch_channel(dc: &Arc<RTCDataChannel>, slot: &ObserverSlot) {
    let label = dc.label().to_string();

    let (open_slot, open_label) = (slot.clone(), label.clone());
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(observer) = observer(&open_slot) {
                observer.on_data_channel_open(&open_label);
            }
        })
    }));

    let (message_slot, message_label) = (slot.clone(), label.clone());
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let (slot, label) = (message_slot.clone(), message_label.clone());
        Box::pin(async move {
            if let Some(observer) = observer(&slot) {
                observer.on_data_channel_message(&label, message.data);
            }
        })
    }));

    let (close_slot, close_label) = (slot.clone(), label.clone());
    dc.on_close(Box::new(move || {
        let (slot, label) = (close_slot.clone(), close_label.clone());
        Box::pin(async move {
            if let Some(observer) = observer(&slot) {
                observer.on_data_channel_close(&label);
            }
        })
    }));

    let error_slot = slot.clone();
    dc.on_error(Box::new(move |error: webrtc::Error| {
        let (slot, label) = (error_slot.clone(), label.clone());
        Box::pin(async move {
            if let Some(observer) = observer(&slot) {
                observer.on_data_channel_error(&label, &error.to_string());
            }
        })
    }));
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
}

fn from_rtc(description: RTCSessionDescription) -> Option<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => {
            Some(SessionDescription::answer(description.sdp))
        }
        _ => None,
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn set_observer(&self, observer: Arc<dyn PeerObserver>) {
        *self.observer.write() = Some(observer);
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description =
            to_rtc(description).map_err(|e| PeerError::RemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::RemoteDescription(e.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Generate(SdpKind::Answer, e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| PeerError::Generate(SdpKind::Offer, e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description =
            to_rtc(description).map_err(|e| PeerError::LocalDescription(e.to_string()))?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| PeerError::LocalDescription(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn add_ice_candidate(&self, candidate: RemoteCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                ..Default::default()
            })
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.observer.write().take();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Close(e.to_string()))
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| PeerError::DataChannel(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.dc
            .close()
            .await
            .map_err(|e| PeerError::DataChannel(e.to_string()))
    }
}
