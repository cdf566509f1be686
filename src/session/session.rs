use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn, Instrument, Span};

use crate::messaging::endpoint::EndpointIdentity;
use crate::messaging::payload::{IceCandidate, Payload, SdpKind, Signal, SignalData};
use crate::session::config::SessionConfig;
use crate::session::media::{DataChannelInfo, DataChannelInit, LocalTrack, MediaConnection, MediaEvent, PeerConnectionState, RemoteTrack, SignalingState, TrackSenderId};
use crate::transport::stream::{Stream, StreamHandler};


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    New,
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    Track(RemoteTrack),
    DataChannel(DataChannelInfo),
}

/// The side with the greater (conn id, peer id, group id) is impolite: it ignores colliding
///  offers and drives ICE restarts. Both sides compute this from the same two identities, so
///  exactly one of them is impolite.
pub fn is_impolite(local: &EndpointIdentity, remote: &EndpointIdentity) -> bool {
    (local.conn_id, &local.peer_id, &local.group_id) > (remote.conn_id, &remote.peer_id, &remote.group_id)
}

/// Negotiates a media connection with one remote endpoint, exchanging descriptors and ICE
///  candidates as reliable signals over a [Stream].
///
/// Negotiation follows the 'perfect negotiation' pattern: both sides offer whenever their
///  media connection asks for it, and colliding offers are resolved by the impolite side
///  ignoring the remote offer while the polite side accepts it (rolling back its own). Every
///  ICE restart increments a generation counter that is sent with each signal, and signals from
///  an older generation are dropped.
pub struct Session {
    stream: Arc<Stream>,
    media: Arc<dyn MediaConnection>,
    config: Arc<SessionConfig>,
    impolite: bool,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    cancel: CancellationToken,
    myself: Weak<Session>,
    span: Span,
}

struct SessionInner {
    state: SessionState,
    generation_counter: u32,
    making_offer: bool,
    join_handled: bool,
    pending_candidates: Vec<IceCandidate>,
    ice_restart_count: u32,
    last_ice_restart: Option<Instant>,
    scheduled_restart: Option<JoinHandle<()>>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session{{{:?} -> {:?}}}", self.stream.local(), self.stream.remote())
    }
}

impl Session {
    /// Creates a session on top of a stream, taking over the stream's handler. `media_events`
    ///  is the event channel belonging to `media`.
    pub fn new(
        stream: Arc<Stream>,
        media: Arc<dyn MediaConnection>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
        config: Arc<SessionConfig>,
    ) -> Arc<Session> {
        let impolite = is_impolite(stream.local(), stream.remote());
        let span = debug_span!(parent: stream.span(), "session", impolite);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let session = Arc::new_cyclic(|myself: &Weak<Session>| Session {
            stream: stream.clone(),
            media,
            config,
            impolite,
            inner: Mutex::new(SessionInner {
                state: SessionState::New,
                generation_counter: 0,
                making_offer: false,
                join_handled: false,
                pending_candidates: vec![],
                ice_restart_count: 0,
                last_ice_restart: None,
                scheduled_restart: None,
            }),
            events,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            myself: myself.clone(),
            span,
        });

        stream.set_handler(Arc::new(SessionStreamHandler { session: Arc::downgrade(&session) }));
        tokio::spawn(
            Self::media_event_loop(Arc::downgrade(&session), media_events, session.cancel.clone())
                .instrument(session.span.clone())
        );
        session
    }

    async fn media_event_loop(session: Weak<Session>, mut media_events: mpsc::UnboundedReceiver<MediaEvent>, cancel: CancellationToken) {
        loop {
            let event = select! {
                _ = cancel.cancelled() => break,
                event = media_events.recv() => event,
            };
            let Some(event) = event else {
                debug!("media event channel closed");
                break;
            };
            let Some(session) = session.upgrade() else {
                break;
            };
            session.on_media_event(event).await;
        }
    }

    /// `<peer id>:<conn id>` of the remote endpoint
    pub fn id(&self) -> String {
        let remote = self.stream.remote();
        format!("{}:{}", remote.peer_id, remote.conn_id)
    }

    pub fn remote(&self) -> &EndpointIdentity {
        self.stream.remote()
    }

    pub fn is_impolite(&self) -> bool {
        self.impolite
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn generation_counter(&self) -> u32 {
        self.inner().generation_counter
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn media(&self) -> &Arc<dyn MediaConnection> {
        &self.media
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn start(&self) {
        if self.state() == SessionState::New {
            self.set_state(SessionState::Initialized);
        }
    }

    pub async fn add_track(&self, track: LocalTrack) -> anyhow::Result<TrackSenderId> {
        self.media.add_track(track).await
    }

    pub async fn remove_track(&self, sender: TrackSenderId) -> anyhow::Result<()> {
        self.media.remove_track(sender).await
    }

    pub async fn create_data_channel(&self, init: DataChannelInit) -> anyhow::Result<DataChannelInfo> {
        self.media.create_data_channel(init).await
    }

    fn publish(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, to: SessionState) {
        let from = {
            let mut inner = self.inner();
            if inner.state == to || inner.state == SessionState::Closed {
                return;
            }
            let from = inner.state;
            inner.state = to;
            from
        };
        debug!(parent: &self.span, ?from, ?to, "session state changed");
        self.publish(SessionEvent::StateChanged { from, to });
    }

    /// Payloads the remote endpoint sent over the stream
    pub async fn handle_message(&self, payload: Payload) -> anyhow::Result<()> {
        match payload {
            Payload::Signal(signal) => self.handle_signal(signal).await,
            Payload::Join => {
                // the connecting side keeps probing until it sees our first message, only the
                //  first probe starts negotiation
                let first = !std::mem::replace(&mut self.inner().join_handled, true);
                if first {
                    self.negotiate().await;
                }
                Ok(())
            }
            Payload::Bye | Payload::Ack(_) => Ok(()),
        }
    }

    async fn on_media_event(&self, event: MediaEvent) {
        trace!(?event, "media event");
        match event {
            MediaEvent::NegotiationNeeded => self.negotiate().await,
            MediaEvent::IceCandidate(Some(candidate)) => self.send_signal(SignalData::IceCandidate(candidate)),
            MediaEvent::IceCandidate(None) => debug!("local candidate gathering complete"),
            MediaEvent::ConnectionStateChange(state) => self.on_connection_state_change(state).await,
            MediaEvent::IceConnectionStateChange(state) => {
                if state.accepts_candidates() {
                    self.flush_pending_candidates().await;
                }
            }
            MediaEvent::Track(track) => self.publish(SessionEvent::Track(track)),
            MediaEvent::DataChannel(channel) => self.publish(SessionEvent::DataChannel(channel)),
        }
    }

    async fn negotiate(&self) {
        if self.is_closed() {
            return;
        }

        self.inner().making_offer = true;
        let result = async {
            let offer = self.media.create_offer().await?;
            self.media.set_local_description(offer.clone()).await?;
            Ok::<_, anyhow::Error>(offer)
        }.await;
        self.inner().making_offer = false;

        match result {
            Ok(offer) => {
                debug!(parent: &self.span, "sending offer");
                self.send_signal(SignalData::Sdp(offer));
            }
            Err(e) => warn!(parent: &self.span, "failed to create offer: {:#}", e),
        }
    }

    async fn handle_signal(&self, signal: Signal) -> anyhow::Result<()> {
        let adopted_generation = {
            let mut inner = self.inner();
            if signal.generation_counter < inner.generation_counter {
                debug!(parent: &self.span, remote = signal.generation_counter, local = inner.generation_counter, "dropping signal from a stale generation");
                return Ok(());
            }
            if signal.generation_counter > inner.generation_counter {
                inner.generation_counter = signal.generation_counter;
                true
            }
            else {
                false
            }
        };
        if adopted_generation {
            info!(parent: &self.span, generation = signal.generation_counter, "remote side restarted ice");
            self.media.restart_ice();
        }

        match signal.data {
            SignalData::IceCandidate(candidate) => {
                self.inner().pending_candidates.push(candidate);
                self.flush_pending_candidates().await;
            }
            SignalData::Sdp(desc) => {
                let is_offer = desc.kind == SdpKind::Offer;
                let offer_collision = is_offer &&
                    (self.inner().making_offer || self.media.signaling_state() != SignalingState::Stable);

                if offer_collision && self.impolite {
                    debug!(parent: &self.span, "offer collision - ignoring remote offer");
                    return Ok(());
                }

                self.media.set_remote_description(desc).await?;
                self.flush_pending_candidates().await;

                if is_offer {
                    let answer = self.media.create_answer().await?;
                    self.media.set_local_description(answer.clone()).await?;
                    debug!(parent: &self.span, "sending answer");
                    self.send_signal(SignalData::Sdp(answer));
                }
            }
        }
        Ok(())
    }

    /// Applies buffered remote candidates once the media connection can take them. A candidate
    ///  that is rejected is logged and skipped.
    async fn flush_pending_candidates(&self) {
        if !self.media.has_remote_description() || !self.media.ice_connection_state().accepts_candidates() {
            return;
        }

        let candidates = std::mem::take(&mut self.inner().pending_candidates);
        for candidate in candidates {
            if let Err(e) = self.media.add_ice_candidate(candidate).await {
                warn!(parent: &self.span, "failed to add ice candidate - skipping: {:#}", e);
            }
        }
    }

    fn send_signal(&self, data: SignalData) {
        let signal = Signal {
            generation_counter: self.inner().generation_counter,
            data,
        };
        let stream = self.stream.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.send(Payload::Signal(signal), true, None).await {
                warn!("failed to send signal: {:#}", e);
            }
        }.instrument(self.span.clone()));
    }

    async fn on_connection_state_change(&self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::New => {}
            PeerConnectionState::Connecting => self.set_state(SessionState::Connecting),
            PeerConnectionState::Connected => {
                self.inner().ice_restart_count = 0;
                self.set_state(SessionState::Connected);
            }
            PeerConnectionState::Disconnected => self.set_state(SessionState::Disconnected),
            PeerConnectionState::Failed => {
                self.trigger_ice_restart().await;
                self.set_state(SessionState::Disconnected);
            }
            PeerConnectionState::Closed => self.close("media connection closed").await,
        }
    }

    /// Restarts ICE right away, or at the end of the debounce window if the previous restart
    ///  was less than `ice_restart_debounce` ago. Only the impolite side restarts, the polite
    ///  side follows when it sees the increased generation.
    async fn trigger_ice_restart(&self) {
        if !self.impolite {
            debug!(parent: &self.span, "connection failed - leaving the ice restart to the other side");
            return;
        }

        {
            let mut inner = self.inner();
            if inner.scheduled_restart.is_some() {
                debug!(parent: &self.span, "ice restart is already scheduled");
                return;
            }

            if let Some(last) = inner.last_ice_restart {
                let elapsed = last.elapsed();
                if elapsed < self.config.ice_restart_debounce {
                    let delay = self.config.ice_restart_debounce - elapsed;
                    debug!(parent: &self.span, ?delay, "deferring ice restart");

                    let session = self.myself.clone();
                    inner.scheduled_restart = Some(tokio::spawn(async move {
                        sleep(delay).await;
                        if let Some(session) = session.upgrade() {
                            session.restart_ice_now().await;
                        }
                    }.instrument(self.span.clone())));
                    return;
                }
            }
        }

        self.restart_ice_now().await;
    }

    async fn restart_ice_now(&self) {
        let generation = {
            let mut inner = self.inner();
            inner.scheduled_restart = None;
            if inner.ice_restart_count >= self.config.ice_restart_max_count {
                None
            }
            else {
                inner.ice_restart_count += 1;
                inner.generation_counter += 1;
                inner.last_ice_restart = Some(Instant::now());
                Some(inner.generation_counter)
            }
        };

        if self.is_closed() {
            return;
        }
        match generation {
            Some(generation) => {
                info!(parent: &self.span, generation, "restarting ice");
                self.media.restart_ice();
            }
            None => {
                warn!(parent: &self.span, "ice restart limit reached - giving up");
                self.close("ice restart limit reached").await;
            }
        }
    }

    /// Closes the media connection and the underlying stream. Closing a session more than once
    ///  has no effect.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(parent: &self.span, reason, "closing session");

        self.cancel.cancel();
        let scheduled_restart = self.inner().scheduled_restart.take();
        if let Some(handle) = scheduled_restart {
            handle.abort();
        }

        self.media.close().await;
        self.stream.close(reason).await;

        let from = std::mem::replace(&mut self.inner().state, SessionState::Closed);
        if from != SessionState::Closed {
            self.publish(SessionEvent::StateChanged { from, to: SessionState::Closed });
        }
    }
}

struct SessionStreamHandler {
    session: Weak<Session>,
}

#[async_trait]
impl StreamHandler for SessionStreamHandler {
    async fn on_payload(&self, payload: Payload) -> anyhow::Result<()> {
        match self.session.upgrade() {
            Some(session) => session.handle_message(payload).await,
            None => Ok(()),
        }
    }

    fn on_closed(&self, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            let reason = reason.to_string();
            tokio::spawn(async move {
                session.close(&reason).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use crate::messaging::message::Message;
    use crate::messaging::payload::SessionDescription;
    use crate::session::media::MediaKind;
    use crate::test_util::media::FakeMediaConnection;
    use crate::test_util::transport::RecordingStreamTransport;
    use super::*;

    struct Fixture {
        transport: Arc<RecordingStreamTransport>,
        stream: Arc<Stream>,
        media: Arc<FakeMediaConnection>,
        session: Arc<Session>,
    }

    fn local(impolite: bool) -> EndpointIdentity {
        EndpointIdentity::new("g", "a", if impolite { 2000 } else { 1000 })
    }

    fn remote() -> EndpointIdentity {
        EndpointIdentity::new("g", "b", 1500)
    }

    fn fixture(impolite: bool) -> Fixture {
        let transport = RecordingStreamTransport::new();
        let stream = transport.stream(local(impolite), remote());
        let (media, media_events) = FakeMediaConnection::new();
        let session = Session::new(stream.clone(), media.clone(), media_events, Arc::new(SessionConfig::new()));
        Fixture { transport, stream, media, session }
    }

    impl Fixture {
        fn receive_signal(&self, seqnum: u32, generation_counter: u32, data: SignalData) {
            let signal = Signal { generation_counter, data };
            self.stream.on_message(Message::reliable(remote(), self.stream.local().clone(), seqnum, Payload::Signal(signal)));
        }

        fn receive_unreliable(&self, payload: Payload) {
            self.stream.on_message(Message::unreliable(remote(), self.stream.local().clone(), payload));
        }

        fn sent_sdp(&self) -> Vec<(u32, SessionDescription)> {
            self.transport.sent_signals().into_iter()
                .filter_map(|s| match s.data {
                    SignalData::Sdp(desc) => Some((s.generation_counter, desc)),
                    SignalData::IceCandidate(_) => None,
                })
                .collect()
        }
    }

    fn offer() -> SignalData {
        SignalData::Sdp(SessionDescription::new(SdpKind::Offer, "remote-offer"))
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.to_string(),
            sdp_mid: Some("0".to_string()),
            ..Default::default()
        }
    }

    async fn settle() {
        sleep(Duration::from_millis(100)).await;
    }

    #[rstest]
    #[case::lower_conn_id(1000, "a", 2000, "b", false)]
    #[case::higher_conn_id(2000, "a", 1000, "b", true)]
    #[case::same_conn_id_lower_peer(1000, "a", 1000, "b", false)]
    #[case::same_conn_id_higher_peer(1000, "b", 1000, "a", true)]
    fn test_is_impolite(#[case] local_conn: u32, #[case] local_peer: &str, #[case] remote_conn: u32, #[case] remote_peer: &str, #[case] expected: bool) {
        let local = EndpointIdentity::new("g", local_peer, local_conn);
        let remote = EndpointIdentity::new("g", remote_peer, remote_conn);

        assert_eq!(is_impolite(&local, &remote), expected);
        assert_eq!(is_impolite(&remote, &local), !expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_id_and_start() {
        let fx = fixture(false);
        let mut events = fx.session.subscribe();

        assert_eq!(fx.session.id(), "b:1500");
        assert_eq!(fx.session.state(), SessionState::New);
        assert!(!fx.session.is_impolite());

        fx.session.start();
        fx.session.start();

        assert_eq!(fx.session.state(), SessionState::Initialized);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::StateChanged { from: SessionState::New, to: SessionState::Initialized });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_join_triggers_offer() {
        let fx = fixture(false);

        fx.receive_unreliable(Payload::Join);
        settle().await;
        fx.receive_unreliable(Payload::Join);
        settle().await;

        let sent = fx.sent_sdp();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 0);
        assert_eq!(sent[0].1.kind, SdpKind::Offer);
        assert_eq!(fx.media.local_description(), Some(sent[0].1.clone()));
        assert_eq!(fx.media.signaling_state_now(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_is_answered() {
        let fx = fixture(false);

        fx.receive_signal(1, 0, offer());
        settle().await;

        assert_eq!(fx.media.remote_description().map(|d| d.sdp), Some("remote-offer".to_string()));
        let sent = fx.sent_sdp();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, SdpKind::Answer);
        assert_eq!(fx.media.signaling_state_now(), SignalingState::Stable);
        assert!(fx.transport.sent_payloads().contains(&Payload::Ack(crate::messaging::payload::Ack::single(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_completes_negotiation() {
        let fx = fixture(false);
        fx.media.emit(MediaEvent::NegotiationNeeded);
        settle().await;
        assert_eq!(fx.media.signaling_state_now(), SignalingState::HaveLocalOffer);

        fx.receive_signal(1, 0, SignalData::Sdp(SessionDescription::new(SdpKind::Answer, "remote-answer")));
        settle().await;

        assert_eq!(fx.media.signaling_state_now(), SignalingState::Stable);
        assert_eq!(fx.sent_sdp().len(), 1);
    }

    #[rstest]
    #[case::impolite_ignores(true)]
    #[case::polite_accepts(false)]
    #[tokio::test(start_paused = true)]
    async fn test_offer_collision(#[case] impolite: bool) {
        let fx = fixture(impolite);
        fx.media.emit(MediaEvent::NegotiationNeeded);
        settle().await;
        assert_eq!(fx.media.signaling_state_now(), SignalingState::HaveLocalOffer);

        fx.receive_signal(1, 0, offer());
        settle().await;

        let kinds = fx.sent_sdp().into_iter()
            .map(|(_, d)| d.kind)
            .collect::<Vec<_>>();
        if impolite {
            assert_eq!(fx.media.remote_description(), None);
            assert_eq!(kinds, vec![SdpKind::Offer]);
            assert_eq!(fx.media.signaling_state_now(), SignalingState::HaveLocalOffer);
        }
        else {
            assert_eq!(fx.media.remote_description().map(|d| d.kind), Some(SdpKind::Offer));
            assert_eq!(kinds, vec![SdpKind::Offer, SdpKind::Answer]);
            assert_eq!(fx.media.signaling_state_now(), SignalingState::Stable);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collision_while_making_offer() {
        let fx = fixture(true);
        fx.media.set_offer_delay(Duration::from_secs(1));
        fx.media.emit(MediaEvent::NegotiationNeeded);
        settle().await;
        assert_eq!(fx.media.signaling_state_now(), SignalingState::Stable);

        fx.receive_signal(1, 0, offer());
        settle().await;

        assert_eq!(fx.media.remote_description(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_are_buffered_until_remote_description() {
        let fx = fixture(false);

        fx.receive_signal(1, 0, SignalData::IceCandidate(candidate("c1")));
        settle().await;
        assert!(fx.media.applied_candidates().is_empty());

        fx.receive_signal(2, 0, offer());
        settle().await;
        assert_eq!(fx.media.applied_candidates(), vec![candidate("c1")]);

        fx.receive_signal(3, 0, SignalData::IceCandidate(candidate("c2")));
        settle().await;
        assert_eq!(fx.media.applied_candidates(), vec![candidate("c1"), candidate("c2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_wait_for_ice_state() {
        let fx = fixture(false);
        fx.receive_signal(1, 0, offer());
        settle().await;
        fx.media.set_ice_connection_state(crate::session::media::IceConnectionState::Failed);

        fx.receive_signal(2, 0, SignalData::IceCandidate(candidate("c1")));
        settle().await;
        assert!(fx.media.applied_candidates().is_empty());

        fx.media.emit(MediaEvent::IceConnectionStateChange(crate::session::media::IceConnectionState::Checking));
        settle().await;
        assert_eq!(fx.media.applied_candidates(), vec![candidate("c1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_candidate_is_skipped() {
        let fx = fixture(false);
        fx.media.set_fail_candidates(true);

        fx.receive_signal(1, 0, SignalData::IceCandidate(candidate("bad")));
        fx.receive_signal(2, 0, offer());
        settle().await;

        assert!(fx.media.applied_candidates().is_empty());
        assert_eq!(fx.sent_sdp().len(), 1);
        assert!(!fx.session.is_closed());

        fx.media.set_fail_candidates(false);
        fx.receive_signal(3, 0, SignalData::IceCandidate(candidate("good")));
        settle().await;
        assert_eq!(fx.media.applied_candidates(), vec![candidate("good")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_are_signaled() {
        let fx = fixture(false);

        fx.media.emit(MediaEvent::IceCandidate(Some(candidate("local"))));
        fx.media.emit(MediaEvent::IceCandidate(None));
        settle().await;

        assert_eq!(fx.transport.sent_signals(), vec![Signal {
            generation_counter: 0,
            data: SignalData::IceCandidate(candidate("local")),
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_dropped() {
        let fx = fixture(false);

        fx.receive_signal(1, 2, offer());
        settle().await;
        assert_eq!(fx.session.generation_counter(), 2);
        assert_eq!(fx.media.num_ice_restarts(), 1);

        fx.receive_signal(2, 1, SignalData::IceCandidate(candidate("stale")));
        settle().await;
        assert!(fx.media.applied_candidates().is_empty());

        fx.receive_signal(3, 2, SignalData::IceCandidate(candidate("current")));
        settle().await;
        assert_eq!(fx.media.applied_candidates(), vec![candidate("current")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_generation_restarts_ice() {
        let fx = fixture(false);

        fx.receive_signal(1, 3, offer());
        settle().await;

        assert_eq!(fx.session.generation_counter(), 3);
        assert_eq!(fx.media.num_ice_restarts(), 1);
        assert!(fx.sent_sdp().iter().all(|(generation, _)| *generation == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_states() {
        let fx = fixture(false);
        fx.session.start();
        let mut events = fx.session.subscribe();

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Connecting));
        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Connected));
        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Disconnected));
        settle().await;

        assert_eq!(fx.session.state(), SessionState::Disconnected);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::StateChanged { from: SessionState::Initialized, to: SessionState::Connecting });
        assert_eq!(events.try_recv().unwrap(), SessionEvent::StateChanged { from: SessionState::Connecting, to: SessionState::Connected });
        assert_eq!(events.try_recv().unwrap(), SessionEvent::StateChanged { from: SessionState::Connected, to: SessionState::Disconnected });
        assert_eq!(fx.media.num_ice_restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_tracks_and_channels_are_published() {
        let fx = fixture(false);
        let mut events = fx.session.subscribe();
        let track = RemoteTrack { id: "t1".to_string(), kind: MediaKind::Video, stream_ids: vec!["s1".to_string()] };
        let channel = DataChannelInfo { id: 1, label: "chat".to_string() };

        fx.media.emit(MediaEvent::Track(track.clone()));
        fx.media.emit(MediaEvent::DataChannel(channel.clone()));
        settle().await;

        assert_eq!(events.try_recv().unwrap(), SessionEvent::Track(track));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::DataChannel(channel));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adding_track_negotiates() {
        let fx = fixture(false);

        let sender = fx.session.add_track(LocalTrack { id: "mic".to_string(), kind: MediaKind::Audio }).await.unwrap();
        settle().await;
        assert_eq!(fx.media.num_tracks(), 1);
        assert_eq!(fx.sent_sdp().len(), 1);

        fx.session.remove_track(sender).await.unwrap();
        assert_eq!(fx.media.num_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_on_polite_side_does_not_restart() {
        let fx = fixture(false);

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        settle().await;

        assert_eq!(fx.media.num_ice_restarts(), 0);
        assert_eq!(fx.session.generation_counter(), 0);
        assert_eq!(fx.session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_on_impolite_side_restarts() {
        let fx = fixture(true);

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        settle().await;

        assert_eq!(fx.media.num_ice_restarts(), 1);
        assert_eq!(fx.session.generation_counter(), 1);
        assert_eq!(fx.session.state(), SessionState::Disconnected);

        let sent = fx.sent_sdp();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert!(sent[0].1.sdp.contains("ice-restart"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_are_debounced() {
        let fx = fixture(true);

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        settle().await;
        assert_eq!(fx.media.num_ice_restarts(), 1);

        sleep(Duration::from_secs(1)).await;
        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        sleep(Duration::from_secs(1)).await;
        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        settle().await;
        assert_eq!(fx.media.num_ice_restarts(), 1);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(fx.media.num_ice_restarts(), 2);
        assert_eq!(fx.session.generation_counter(), 2);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.media.num_ice_restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_limit_closes_session() {
        let fx = fixture(true);

        for _ in 0..2 {
            fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
            settle().await;
            sleep(Duration::from_secs(6)).await;
        }
        assert_eq!(fx.media.num_ice_restarts(), 2);
        assert!(!fx.session.is_closed());

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        settle().await;

        assert_eq!(fx.media.num_ice_restarts(), 2);
        assert!(fx.session.is_closed());
        assert_eq!(fx.session.state(), SessionState::Closed);
        assert!(fx.media.is_closed());
        assert!(fx.stream.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_resets_restart_count() {
        let fx = fixture(true);

        for _ in 0..2 {
            fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
            settle().await;
            sleep(Duration::from_secs(6)).await;
        }
        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Connected));
        settle().await;

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Failed));
        settle().await;

        assert_eq!(fx.media.num_ice_restarts(), 3);
        assert!(!fx.session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let fx = fixture(false);
        fx.session.start();
        let mut events = fx.session.subscribe();

        fx.session.close("done").await;
        fx.session.close("again").await;

        assert!(fx.session.is_closed());
        assert!(fx.media.is_closed());
        assert!(fx.stream.is_closed());
        assert_eq!(fx.transport.sent_payloads(), vec![Payload::Bye]);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::StateChanged { from: SessionState::Initialized, to: SessionState::Closed });
        assert!(events.try_recv().is_err());

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Connected));
        settle().await;
        assert_eq!(fx.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bye_closes_session() {
        let fx = fixture(false);

        fx.receive_unreliable(Payload::Bye);
        settle().await;

        assert!(fx.session.is_closed());
        assert!(fx.media.is_closed());
        assert!(fx.transport.sent_payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_media_closes_session() {
        let fx = fixture(false);

        fx.media.emit(MediaEvent::ConnectionStateChange(PeerConnectionState::Closed));
        settle().await;

        assert!(fx.session.is_closed());
        assert!(fx.stream.is_closed());
    }
}
