use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use crate::messaging::endpoint::EndpointIdentity;
use crate::messaging::relay::{IceServer, RelayClient};
use crate::session::config::SessionConfig;
use crate::session::media::{MediaConfig, MediaConnectionFactory};
use crate::session::session::Session;
use crate::transport::config::{TransportConfig, TransportOptions};
use crate::transport::stream::Stream;
use crate::transport::transport::{Transport, TransportListener};


#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub group_id: String,
    pub peer_id: String,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    /// ICE servers to use in addition to those the relay hands out
    pub ice_servers: Vec<IceServer>,
    pub connect_timeout: Duration,
    /// Capacity of the broadcast channel for peer events
    pub event_capacity: usize,
}

impl PeerConfig {
    pub fn new(group_id: impl Into<String>, peer_id: impl Into<String>) -> PeerConfig {
        PeerConfig {
            group_id: group_id.into(),
            peer_id: peer_id.into(),
            transport: TransportConfig::new(),
            session: SessionConfig::new(),
            ice_servers: vec![],
            connect_timeout: Duration::from_secs(30),
            event_capacity: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.group_id.is_empty() || self.peer_id.is_empty() {
            return Err(anyhow!("group id and peer id must not be empty"));
        }
        self.transport.validate()?;
        self.session.validate()
    }
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    NewSession(Arc<Session>),
    Closed(String),
}

/// Ties a [Transport] to the [Session]s on top of its streams: every stream, whether this peer
///  connected or was contacted, gets a fresh media connection and a started session.
pub struct Peer {
    transport: Arc<Transport>,
    media_factory: Arc<dyn MediaConnectionFactory>,
    media_config: MediaConfig,
    session_config: Arc<SessionConfig>,
    connect_timeout: Duration,
    sessions: Mutex<FxHashMap<EndpointIdentity, Arc<Session>>>,
    events: broadcast::Sender<PeerEvent>,
    closed: AtomicBool,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Asks the relay for ICE servers and sets up the transport. The peer does not receive
    ///  anything before [Peer::start] is called.
    pub async fn new(relay: Arc<dyn RelayClient>, config: PeerConfig, media_factory: Arc<dyn MediaConnectionFactory>) -> anyhow::Result<Arc<Peer>> {
        config.validate()?;

        let prepared = timeout(config.transport.rpc_timeout, relay.prepare()).await
            .map_err(|_| anyhow!("relay did not answer 'prepare' within {:?}", config.transport.rpc_timeout))?
            .context("preparing the relay")?;
        let mut ice_servers = config.ice_servers;
        ice_servers.extend(prepared.ice_servers);

        let options = TransportOptions::new(config.group_id, config.peer_id)
            .with_config(config.transport);
        let transport = Transport::new(relay, options);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let peer = Arc::new(Peer {
            transport,
            media_factory,
            media_config: MediaConfig { ice_servers },
            session_config: Arc::new(config.session),
            connect_timeout: config.connect_timeout,
            sessions: Default::default(),
            events,
            closed: AtomicBool::new(false),
            listen_task: Default::default(),
        });
        peer.transport.set_listener(Arc::new(PeerTransportListener { peer: Arc::downgrade(&peer) }));
        Ok(peer)
    }

    pub fn identity(&self) -> &EndpointIdentity {
        self.transport.identity()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.media_config.ice_servers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn sessions_map(&self) -> MutexGuard<'_, FxHashMap<EndpointIdentity, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// the sessions that are not closed yet
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_map().values()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    /// Starts polling the relay. Calling this more than once has no effect.
    pub fn start(&self) {
        let mut listen_task = self.listen_task.lock().unwrap_or_else(|p| p.into_inner());
        if listen_task.is_some() || self.is_closed() {
            return;
        }

        let transport = self.transport.clone();
        *listen_task = Some(tokio::spawn(async move {
            transport.listen().await;
        }));
    }

    /// Connects to another peer, returning the session for the new stream
    pub async fn connect(&self, other_group_id: &str, other_peer_id: &str) -> anyhow::Result<Arc<Session>> {
        let stream = self.transport.connect_with_timeout(other_group_id, other_peer_id, self.connect_timeout).await?;
        self.sessions_map().get(stream.remote())
            .cloned()
            .ok_or_else(|| anyhow!("no session for {:?}", stream.remote()))
    }

    fn on_new_stream(&self, stream: Arc<Stream>) {
        if self.is_closed() {
            debug!(parent: stream.span(), "peer is closed - not starting a session");
            return;
        }

        match self.media_factory.create(&self.media_config) {
            Ok((media, media_events)) => {
                let session = Session::new(stream.clone(), media, media_events, self.session_config.clone());
                session.start();
                {
                    let mut sessions = self.sessions_map();
                    sessions.retain(|_, s| !s.is_closed());
                    sessions.insert(stream.remote().clone(), session.clone());
                }
                info!(parent: stream.span(), id = %session.id(), "new session");
                let _ = self.events.send(PeerEvent::NewSession(session));
            }
            Err(e) => {
                warn!(parent: stream.span(), "failed to create a media connection: {:#}", e);
                let span = stream.span().clone();
                tokio::spawn(async move {
                    stream.close("failed to create a media connection").await;
                }.instrument(span));
            }
        }
    }

    /// Closes the transport and all sessions. Closing a peer more than once has no effect.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(parent: self.transport.span(), reason, "closing peer");

        self.transport.close(reason).await;

        let sessions = self.sessions_map().drain()
            .map(|(_, session)| session)
            .collect::<Vec<_>>();
        let mut closing = JoinSet::new();
        for session in sessions {
            let reason = reason.to_string();
            closing.spawn(async move {
                session.close(&reason).await;
            });
        }
        while closing.join_next().await.is_some() {}

        let _ = self.events.send(PeerEvent::Closed(reason.to_string()));
    }
}

struct PeerTransportListener {
    peer: Weak<Peer>,
}

impl TransportListener for PeerTransportListener {
    fn on_new_stream(&self, stream: Arc<Stream>) {
        if let Some(peer) = self.peer.upgrade() {
            peer.on_new_stream(stream);
        }
    }

    fn on_closed(&self, reason: &str) {
        if let Some(peer) = self.peer.upgrade() {
            let reason = reason.to_string();
            tokio::spawn(async move {
                peer.close(&reason).await;
            });
        }
    }
}
