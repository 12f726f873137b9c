//! webrtc-rs implementation of [`PeerTransport`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use medlink_common::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{
    ChannelEvent, ChannelHandle, DataChannel, PeerState, PeerTransport, RemoteTrack,
    TransportEvent, TransportFactory,
};
use crate::config::IceServerConfig;
use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};

pub fn rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: vec![server.url_with_scheme()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        Self {
            ice_servers: rtc_ice_servers(ice_servers),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
    {
        let (transport, events) = RtcTransport::new(self.ice_servers.clone()).await?;
        let transport: Arc<dyn PeerTransport> = Arc::new(transport);
        Ok((transport, events))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcTransport {
    pub async fn new(
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(m).build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering.
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!("failed to serialize local candidate: {}", err),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("peer connection state changed to {:?}", state);
            let _ = state_tx.send(TransportEvent::StateChanged(peer_state(state)));
            Box::pin(async {})
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = track_tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
            Box::pin(async {})
        }));

        let channel_tx = tx;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            info!(label = dc.label(), "remote data channel announced");
            let _ = channel_tx.send(TransportEvent::DataChannel(RtcDataChannel::wrap(dc)));
            Box::pin(async {})
        }));

        Ok((
            Self {
                pc,
                senders: Mutex::new(HashMap::new()),
            },
            rx,
        ))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.senders.lock().await.insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&kind)
            .cloned()
            .ok_or(TransportError::NoSender(kind.as_str()))?;
        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, TransportError> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(RtcDataChannel::wrap(dc))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn connection_state(&self) -> PeerState {
        peer_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = message_tx.send(ChannelEvent::Message(text));
                    }
                    Err(err) => warn!("dropping non-utf8 data channel message: {}", err),
                }
            } else {
                debug!("ignoring binary data channel message ({} bytes)", msg.data.len());
            }
            Box::pin(async {})
        }));

        let close_tx = tx;
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        ChannelHandle {
            channel: Arc::new(Self { dc }),
            events: rx,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Channel(format!(
                "{} is not open",
                self.dc.label()
            )));
        }
        self.dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_carry_credentials() {
        let servers = rtc_ice_servers(&[
            IceServerConfig::stun("stun.example.org:3478"),
            IceServerConfig::turn("turn.example.org:3478", "user", "secret"),
        ]);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(peer_state(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(peer_state(RTCPeerConnectionState::Failed), PeerState::Failed);
        assert_eq!(peer_state(RTCPeerConnectionState::Unspecified), PeerState::New);
    }

    #[tokio::test]
    async fn test_offer_includes_tracks_and_chat_channel() {
        let (transport, _events) = RtcTransport::new(Vec::new()).await.unwrap();
        transport
            .add_track(LocalTrack::new(crate::media::TrackSource::Microphone, "s"))
            .await
            .unwrap();
        transport
            .add_track(LocalTrack::new(crate::media::TrackSource::Camera, "s"))
            .await
            .unwrap();
        let _chat = transport.create_data_channel("chat").await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));
        transport.close().await.unwrap();
    }
}
