use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::messaging::payload::{IceCandidate, SdpKind, SessionDescription};
use crate::session::media::{DataChannelInfo, DataChannelInit, IceConnectionState, LocalTrack, MediaConfig, MediaConnection, MediaConnectionFactory, MediaEvent, PeerConnectionState, SignalingState, TrackSenderId};


/// A media connection that follows the signaling state machine of a real one without doing any
///  networking, recording everything a session does with it
pub struct FakeMediaConnection {
    state: Mutex<FakeState>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

struct FakeState {
    signaling_state: SignalingState,
    ice_connection_state: IceConnectionState,
    connection_state: PeerConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    num_ice_restarts: u32,
    restart_pending: bool,
    num_offers: u32,
    tracks: Vec<(TrackSenderId, LocalTrack)>,
    data_channels: Vec<DataChannelInfo>,
    fail_candidates: bool,
    offer_delay: Duration,
    closed: bool,
}

impl FakeMediaConnection {
    pub fn new() -> (Arc<FakeMediaConnection>, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let fake = FakeMediaConnection {
            state: Mutex::new(FakeState {
                signaling_state: SignalingState::Stable,
                ice_connection_state: IceConnectionState::New,
                connection_state: PeerConnectionState::New,
                local_description: None,
                remote_description: None,
                applied_candidates: vec![],
                num_ice_restarts: 0,
                restart_pending: false,
                num_offers: 0,
                tracks: vec![],
                data_channels: vec![],
                fail_candidates: false,
                offer_delay: Duration::ZERO,
                closed: false,
            }),
            events,
        };
        (Arc::new(fake), receiver)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reports an event to the session, updating the fake's own state for state change events
    pub fn emit(&self, event: MediaEvent) {
        match &event {
            MediaEvent::ConnectionStateChange(s) => self.state().connection_state = *s,
            MediaEvent::IceConnectionStateChange(s) => self.state().ice_connection_state = *s,
            _ => {}
        }
        let _ = self.events.send(event);
    }

    pub fn set_signaling_state(&self, signaling_state: SignalingState) {
        self.state().signaling_state = signaling_state;
    }

    pub fn set_ice_connection_state(&self, ice_connection_state: IceConnectionState) {
        self.state().ice_connection_state = ice_connection_state;
    }

    pub fn set_fail_candidates(&self, fail: bool) {
        self.state().fail_candidates = fail;
    }

    /// creating an offer takes this long, which keeps the session in its 'making offer' phase
    pub fn set_offer_delay(&self, delay: Duration) {
        self.state().offer_delay = delay;
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().remote_description.clone()
    }

    pub fn signaling_state_now(&self) -> SignalingState {
        self.state().signaling_state
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().applied_candidates.clone()
    }

    pub fn num_ice_restarts(&self) -> u32 {
        self.state().num_ice_restarts
    }

    pub fn num_tracks(&self) -> usize {
        self.state().tracks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl MediaConnection for FakeMediaConnection {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let delay = self.state().offer_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.state();
        if state.closed {
            bail!("media connection is closed");
        }
        state.num_offers += 1;
        let restart = if state.restart_pending { " ice-restart" } else { "" };
        state.restart_pending = false;
        Ok(SessionDescription::new(SdpKind::Offer, format!("offer-{}{}", state.num_offers, restart)))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let state = self.state();
        if state.signaling_state != SignalingState::HaveRemoteOffer {
            bail!("cannot create an answer in signaling state {:?}", state.signaling_state);
        }
        Ok(SessionDescription::new(SdpKind::Answer, "answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let mut state = self.state();
        state.signaling_state = match (desc.kind, state.signaling_state) {
            (SdpKind::Offer, SignalingState::Stable) | (SdpKind::Offer, SignalingState::HaveLocalOffer) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) | (SdpKind::Answer, SignalingState::HaveLocalPranswer) => SignalingState::Stable,
            (SdpKind::Pranswer, SignalingState::HaveRemoteOffer) => SignalingState::HaveLocalPranswer,
            (SdpKind::Rollback, _) => SignalingState::Stable,
            (kind, s) => bail!("cannot apply local {:?} in signaling state {:?}", kind, s),
        };
        state.local_description = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let mut state = self.state();
        state.signaling_state = match (desc.kind, state.signaling_state) {
            // an offer in 'have-local-offer' implicitly rolls back the local offer
            (SdpKind::Offer, SignalingState::Stable) | (SdpKind::Offer, SignalingState::HaveLocalOffer) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) | (SdpKind::Answer, SignalingState::HaveRemotePranswer) => SignalingState::Stable,
            (SdpKind::Pranswer, SignalingState::HaveLocalOffer) => SignalingState::HaveRemotePranswer,
            (SdpKind::Rollback, _) => SignalingState::Stable,
            (kind, s) => bail!("cannot apply remote {:?} in signaling state {:?}", kind, s),
        };
        state.remote_description = Some(desc);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state().remote_description.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        let mut state = self.state();
        if state.fail_candidates {
            bail!("invalid candidate {:?}", candidate.candidate);
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn restart_ice(&self) {
        {
            let mut state = self.state();
            state.num_ice_restarts += 1;
            state.restart_pending = true;
        }
        let _ = self.events.send(MediaEvent::NegotiationNeeded);
    }

    fn signaling_state(&self) -> SignalingState {
        self.state().signaling_state
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state().ice_connection_state
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state().connection_state
    }

    async fn add_track(&self, track: LocalTrack) -> anyhow::Result<TrackSenderId> {
        let id = {
            let mut state = self.state();
            let id = TrackSenderId(state.tracks.len() as u32 + 1);
            state.tracks.push((id, track));
            id
        };
        let _ = self.events.send(MediaEvent::NegotiationNeeded);
        Ok(id)
    }

    async fn remove_track(&self, sender: TrackSenderId) -> anyhow::Result<()> {
        {
            let mut state = self.state();
            let len_before = state.tracks.len();
            state.tracks.retain(|(id, _)| *id != sender);
            if state.tracks.len() == len_before {
                bail!("no track for {:?}", sender);
            }
        }
        let _ = self.events.send(MediaEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_data_channel(&self, init: DataChannelInit) -> anyhow::Result<DataChannelInfo> {
        let info = {
            let mut state = self.state();
            let info = DataChannelInfo {
                id: state.data_channels.len() as u16,
                label: init.label,
            };
            state.data_channels.push(info.clone());
            info
        };
        let _ = self.events.send(MediaEvent::NegotiationNeeded);
        Ok(info)
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.signaling_state = SignalingState::Closed;
        state.ice_connection_state = IceConnectionState::Closed;
        state.connection_state = PeerConnectionState::Closed;
    }
}

/// Creates [FakeMediaConnection]s, keeping track of them
#[derive(Default)]
pub struct FakeMediaFactory {
    created: Mutex<Vec<Arc<FakeMediaConnection>>>,
    configs: Mutex<Vec<MediaConfig>>,
}

impl FakeMediaFactory {
    pub fn new() -> Arc<FakeMediaFactory> {
        Arc::new(FakeMediaFactory::default())
    }

    pub fn created(&self) -> Vec<Arc<FakeMediaConnection>> {
        self.created.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn configs(&self) -> Vec<MediaConfig> {
        self.configs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl MediaConnectionFactory for FakeMediaFactory {
    fn create(&self, config: &MediaConfig) -> anyhow::Result<(Arc<dyn MediaConnection>, mpsc::UnboundedReceiver<MediaEvent>)> {
        let (media, events) = FakeMediaConnection::new();
        self.created.lock().unwrap_or_else(|p| p.into_inner()).push(media.clone());
        self.configs.lock().unwrap_or_else(|p| p.into_inner()).push(config.clone());
        Ok((media, events))
    }
}
