use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use crate::messaging::endpoint::{EndpointIdentity, EndpointInfo, RESERVED_CONN_ID_MAX};
use crate::messaging::message::Message;
use crate::messaging::payload::Payload;
use crate::messaging::relay::RelayClient;
use crate::transport::config::{TransportConfig, TransportOptions};
use crate::transport::stream::{Stream, StreamTransport};
use crate::util::backoff::{retry, RecoverablePredicate};
use crate::util::cancel::join_cancellation;
use crate::util::random::Random;


/// Notified about streams that other endpoints open to this transport, and about the transport
///  shutting down. Callbacks are invoked synchronously, so a new stream's handler can be
///  registered before the stream's first message is delivered.
#[cfg_attr(test, automock)]
pub trait TransportListener: Send + Sync + 'static {
    fn on_new_stream(&self, stream: Arc<Stream>);
    fn on_closed(&self, reason: &str);
}

/// An endpoint on the relay. It polls the relay for messages addressed to it and demultiplexes
///  them to one [Stream] per remote endpoint identity, creating streams as previously unknown
///  endpoints contact it.
pub struct Transport {
    identity: EndpointIdentity,
    enable_discovery: bool,
    relay: Arc<dyn RelayClient>,
    config: Arc<TransportConfig>,
    random: Arc<dyn Random>,
    is_recoverable: RecoverablePredicate,
    streams: Mutex<FxHashMap<EndpointIdentity, Arc<Stream>>>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    myself: Weak<Transport>,
    span: Span,
}

impl Debug for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport{{{:?}}}", self.identity)
    }
}

impl Transport {
    pub fn new(relay: Arc<dyn RelayClient>, options: TransportOptions) -> Arc<Transport> {
        let conn_id = options.random.next_conn_id(RESERVED_CONN_ID_MAX);
        let identity = EndpointIdentity::new(options.group_id, options.peer_id, conn_id);
        let span = info_span!("transport", group_id = %identity.group_id, peer_id = %identity.peer_id, conn_id);

        Arc::new_cyclic(|myself| Transport {
            identity,
            enable_discovery: options.config.enable_discovery,
            relay,
            config: options.config,
            random: options.random,
            is_recoverable: options.is_recoverable,
            streams: Default::default(),
            listener: Default::default(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            myself: myself.clone(),
            span,
        })
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write().unwrap_or_else(|p| p.into_inner()) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn streams(&self) -> MutexGuard<'_, FxHashMap<EndpointIdentity, Arc<Stream>>> {
        self.streams.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn all_streams(&self) -> Vec<Arc<Stream>> {
        self.streams().values().cloned().collect()
    }

    /// any stream to the given peer, regardless of its conn id
    pub fn find_stream(&self, group_id: &str, peer_id: &str) -> Option<Arc<Stream>> {
        self.streams().values()
            .find(|s| s.remote().is_same_peer(group_id, peer_id))
            .cloned()
    }

    async fn call_with_retry<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> anyhow::Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let rpc_timeout = self.config.rpc_timeout;
        retry(&self.config.retry_policy(), cancel, self.is_recoverable.as_ref(), self.random.as_ref(), || {
            let call = op();
            async move {
                timeout(rpc_timeout, call).await
                    .map_err(|_| anyhow!("relay call timed out after {:?}", rpc_timeout))?
            }
        }).await
    }

    /// Polls the relay until the transport is closed. A fatal relay error closes the transport.
    pub async fn listen(&self) {
        let info = EndpointInfo {
            identity: self.identity.clone(),
            enable_discovery: self.enable_discovery,
        };

        async {
            info!("listening for messages");
            loop {
                let result = self.call_with_retry(&self.cancel, || self.relay.recv(info.clone(), self.config.poll_timeout)).await;
                match result {
                    Ok(Some(msgs)) => self.handle_messages(msgs),
                    Ok(None) => {
                        debug!("transport was closed - stopping to listen");
                        break;
                    }
                    Err(e) => {
                        error!("fatal error polling the relay: {:#}", e);
                        self.force_close(format!("fatal error polling the relay: {:#}", e));
                        break;
                    }
                }
            }
        }.instrument(self.span.clone()).await
    }

    /// Demultiplexes messages to streams, creating a stream for every previously unknown sender
    pub fn handle_messages(&self, msgs: Vec<Message>) {
        let _entered = self.span.enter();

        for msg in msgs {
            if self.is_closed() {
                debug!("transport is closed - dropping received messages");
                return;
            }

            let to = &msg.header.to;
            if !to.has_reserved_conn_id() && to.conn_id != self.identity.conn_id {
                warn!(?to, "received a message for a different conn id - was this endpoint restarted? Ignoring the message");
                continue;
            }

            let from = msg.header.from.clone();
            let existing = self.streams().get(&from).cloned();
            let stream = match existing {
                Some(stream) => stream,
                None => {
                    if from.peer_id == self.identity.peer_id {
                        warn!(?from, "received a message from myself - ignoring");
                        continue;
                    }
                    if matches!(msg.payload, Payload::Bye | Payload::Ack(_)) {
                        debug!(?from, "received {:?} from an unknown endpoint - ignoring", msg.payload);
                        continue;
                    }
                    self.open_stream(from)
                }
            };

            stream.on_message(msg);
        }
    }

    /// The stream to `remote`, creating it if there is none. Concurrent callers for the same
    ///  remote get the same stream, and the listener is notified once, outside the lock.
    fn open_stream(&self, remote: EndpointIdentity) -> Arc<Stream> {
        let (stream, is_new) = match self.streams().entry(remote) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let transport: Weak<dyn StreamTransport> = self.myself.clone();
                let stream = Stream::new(self.identity.clone(), e.key().clone(), transport, self.config.clone(), &self.span);
                e.insert(stream.clone());
                (stream, true)
            }
        };

        if is_new {
            debug!(remote = ?stream.remote(), "new stream");
            if let Some(listener) = self.listener() {
                listener.on_new_stream(stream.clone());
            }
        }
        stream
    }

    /// Probes the other peer's discovery address with `Join` messages until a stream to that
    ///  peer exists, i.e. until the other peer answered. Fails when `cancel` fires first.
    pub async fn connect(&self, other_group_id: &str, other_peer_id: &str, cancel: &CancellationToken) -> anyhow::Result<Arc<Stream>> {
        let cancel = join_cancellation(&[cancel, &self.cancel]);
        let target = EndpointIdentity::discovery(other_group_id, other_peer_id);

        async {
            loop {
                if let Some(stream) = self.find_stream(other_group_id, other_peer_id) {
                    info!(remote = ?stream.remote(), "connected");
                    return Ok(stream);
                }
                if cancel.is_cancelled() {
                    bail!("connecting to {}/{} was cancelled", other_group_id, other_peer_id);
                }

                debug!(?target, "sending join");
                let join = Message::unreliable(self.identity.clone(), target.clone(), Payload::Join);
                if let Err(e) = self.send(join, Some(&*cancel)).await {
                    if !cancel.is_cancelled() {
                        return Err(e.context(format!("connecting to {}/{}", other_group_id, other_peer_id)));
                    }
                }

                select! {
                    _ = sleep(self.config.connect_retry_interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }.instrument(self.span.clone()).await
    }

    pub async fn connect_with_timeout(&self, other_group_id: &str, other_peer_id: &str, connect_timeout: Duration) -> anyhow::Result<Arc<Stream>> {
        match timeout(connect_timeout, self.connect(other_group_id, other_peer_id, &CancellationToken::new())).await {
            Ok(result) => result,
            Err(_) => bail!("timed out connecting to {}/{} after {:?}", other_group_id, other_peer_id, connect_timeout),
        }
    }

    /// Sends a message through the relay, retrying recoverable failures. Messages the relay
    ///  piggybacks on the response are handled like polled messages. A fatal failure closes the
    ///  transport.
    pub async fn send(&self, msg: Message, cancel: Option<&CancellationToken>) -> anyhow::Result<()> {
        let cancel = match cancel {
            Some(cancel) => join_cancellation(&[cancel, &self.cancel]),
            None => join_cancellation(&[&self.cancel]),
        };

        trace!(parent: &self.span, to = ?msg.header.to, seqnum = msg.header.seqnum, "sending message");
        let result = self.call_with_retry(&cancel, || self.relay.send(msg.clone())).await;
        match result {
            Ok(Some(replies)) => {
                if !replies.is_empty() {
                    self.handle_messages(replies);
                }
                Ok(())
            }
            Ok(None) => {
                debug!(parent: &self.span, to = ?msg.header.to, "send was cancelled - message dropped");
                Err(anyhow!("sending to {:?} was cancelled", msg.header.to))
            }
            Err(e) => {
                error!(parent: &self.span, "fatal error sending a message: {:#}", e);
                self.force_close(format!("fatal error sending a message: {:#}", e));
                Err(e)
            }
        }
    }

    fn force_close(&self, reason: String) {
        if let Some(transport) = self.myself.upgrade() {
            tokio::spawn(async move {
                transport.close(&reason).await;
            });
        }
    }

    /// Closes all streams (each sending a `Bye` on a best effort basis) and stops polling.
    ///  Closing a transport more than once has no effect.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(parent: &self.span, reason, "closing transport");

        let streams = self.streams().drain()
            .map(|(_, stream)| stream)
            .collect::<Vec<_>>();

        let mut closing = JoinSet::new();
        for stream in streams {
            let reason = reason.to_string();
            closing.spawn(async move {
                stream.close(&reason).await;
            });
        }
        while closing.join_next().await.is_some() {}

        self.cancel.cancel();

        let listener = self.listener.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(listener) = listener {
            listener.on_closed(reason);
        }
    }
}

#[async_trait]
impl StreamTransport for Transport {
    async fn send(&self, msg: Message, cancel: Option<CancellationToken>) -> anyhow::Result<()> {
        Transport::send(self, msg, cancel.as_ref()).await
    }

    fn on_stream_closed(&self, stream: &Stream) {
        let mut streams = self.streams();
        let is_registered = streams.get(stream.remote())
            .map(|s| std::ptr::eq(Arc::as_ptr(s), stream))
            .unwrap_or(false);
        if is_registered {
            streams.remove(stream.remote());
        }
    }
}
