use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messaging::payload::{IceCandidate, SessionDescription};
use crate::messaging::relay::IceServer;


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// remote candidates can be applied in these states
    pub fn accepts_candidates(&self) -> bool {
        use IceConnectionState::*;
        matches!(self, New | Checking | Connected | Completed | Disconnected)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_ids: Vec<String>,
}

/// Handle for a track that was added to a media connection, used to remove it again
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TrackSenderId(pub u32);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataChannelInit {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataChannelInfo {
    pub id: u16,
    pub label: String,
}

/// Things a media connection reports on its own initiative
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MediaEvent {
    NegotiationNeeded,
    /// a local candidate was gathered, `None` when gathering is complete
    IceCandidate(Option<IceCandidate>),
    ConnectionStateChange(PeerConnectionState),
    IceConnectionStateChange(IceConnectionState),
    Track(RemoteTrack),
    DataChannel(DataChannelInfo),
}

/// The peer-to-peer media primitive a session negotiates, e.g. a WebRTC peer connection. Its
///  events are delivered through the channel returned by [MediaConnectionFactory::create].
#[async_trait]
pub trait MediaConnection: Send + Sync + 'static {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;

    /// Makes the next offer restart ICE, and requests negotiation for it
    fn restart_ice(&self);

    fn signaling_state(&self) -> SignalingState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn connection_state(&self) -> PeerConnectionState;

    async fn add_track(&self, track: LocalTrack) -> anyhow::Result<TrackSenderId>;
    async fn remove_track(&self, sender: TrackSenderId) -> anyhow::Result<()>;
    async fn create_data_channel(&self, init: DataChannelInit) -> anyhow::Result<DataChannelInfo>;

    async fn close(&self);
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MediaConfig {
    pub ice_servers: Vec<IceServer>,
}

pub trait MediaConnectionFactory: Send + Sync + 'static {
    fn create(&self, config: &MediaConfig) -> anyhow::Result<(Arc<dyn MediaConnection>, mpsc::UnboundedReceiver<MediaEvent>)>;
}
