use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument, Span};

use crate::messaging::endpoint::EndpointIdentity;
use crate::messaging::message::Message;
use crate::messaging::payload::{Ack, Payload};
use crate::transport::config::TransportConfig;
use crate::transport::queue::{DeliveryQueue, Enqueued, MessageConsumer};
use crate::util::cancel::join_cancellation;


/// What a stream needs from the transport that owns it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, msg: Message, cancel: Option<CancellationToken>) -> anyhow::Result<()>;
    fn on_stream_closed(&self, stream: &Stream);
}

/// The application side of a stream. There is at most one handler per stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn on_payload(&self, payload: Payload) -> anyhow::Result<()>;
    fn on_closed(&self, reason: &str);
}


/// A logical connection between this transport and one remote endpoint identity, multiplexed
///  over the relay.
///
/// Reliable messages get a per-stream seqnum and are resent until the other side acks them (or
///  the resend budget is exhausted). The receiving side acks every reliable message it gets and
///  deduplicates them by seqnum, so the application sees each reliable message exactly once.
pub struct Stream {
    local: EndpointIdentity,
    remote: EndpointIdentity,
    transport: Weak<dyn StreamTransport>,
    config: Arc<TransportConfig>,
    last_seqnum: AtomicU32,
    acked: Mutex<FxHashMap<u32, bool>>,
    queue: Arc<DeliveryQueue>,
    handler: RwLock<Option<Arc<dyn StreamHandler>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    span: Span,
}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream{{{:?} -> {:?}}}", self.local, self.remote)
    }
}

impl Stream {
    pub fn new(
        local: EndpointIdentity,
        remote: EndpointIdentity,
        transport: Weak<dyn StreamTransport>,
        config: Arc<TransportConfig>,
        parent_span: &Span,
    ) -> Arc<Stream> {
        let span = debug_span!(parent: parent_span, "stream", remote = %remote);
        Arc::new_cyclic(|myself: &Weak<Stream>| {
            let dispatcher = Arc::new(StreamDispatcher { stream: myself.clone() });
            Stream {
                queue: DeliveryQueue::new(dispatcher, span.clone()),
                local,
                remote,
                transport,
                config,
                last_seqnum: AtomicU32::new(0),
                acked: Default::default(),
                handler: Default::default(),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                span,
            }
        })
    }

    pub fn local(&self) -> &EndpointIdentity {
        &self.local
    }

    pub fn remote(&self) -> &EndpointIdentity {
        &self.remote
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// fires when the stream is closed
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers the handler for incoming payloads, replacing a previously registered one
    pub fn set_handler(&self, handler: Arc<dyn StreamHandler>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn StreamHandler>> {
        self.handler.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn acked(&self) -> MutexGuard<'_, FxHashMap<u32, bool>> {
        self.acked.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_acked(&self, seqnum: u32) -> bool {
        self.acked().get(&seqnum).copied().unwrap_or(false)
    }

    fn transport(&self) -> anyhow::Result<Arc<dyn StreamTransport>> {
        self.transport.upgrade()
            .ok_or_else(|| anyhow!("transport of {:?} was dropped", self))
    }

    /// Entry point for messages the transport received for this stream
    pub fn on_message(self: &Arc<Self>, msg: Message) {
        let seqnum = msg.header.seqnum;
        let is_reliable = msg.header.reliable;

        if self.queue.enqueue(msg) == Enqueued::Duplicate && is_reliable {
            // the previous ack may have been lost
            self.send_ack(seqnum);
        }
    }

    fn send_ack(self: &Arc<Self>, seqnum: u32) {
        let stream = self.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.send(Payload::Ack(Ack::single(seqnum)), false, None).await {
                debug!(seqnum, "failed to send ack: {:#}", e);
            }
        }.instrument(self.span.clone()));
    }

    /// Sends a payload to the remote endpoint. A reliable send completes when the other side
    ///  acknowledged the message, and fails if the resend budget is exhausted, the stream is
    ///  closed or `cancel` fires before that.
    pub async fn send(&self, payload: Payload, reliable: bool, cancel: Option<&CancellationToken>) -> anyhow::Result<()> {
        let transport = self.transport()?;

        if !reliable {
            let msg = Message::unreliable(self.local.clone(), self.remote.clone(), payload);
            return transport.send(msg, Some(self.cancel.clone())).await;
        }

        let cancel = match cancel {
            Some(cancel) => join_cancellation(&[cancel, &self.cancel]),
            None => join_cancellation(&[&self.cancel]),
        };

        let seqnum = self.last_seqnum.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.acked().insert(seqnum, false);
        let msg = Message::reliable(self.local.clone(), self.remote.clone(), seqnum, payload);

        for attempt in 1..=self.config.max_reliable_attempts {
            if cancel.is_cancelled() {
                bail!("sending seqnum {} was cancelled", seqnum);
            }

            trace!(parent: &self.span, seqnum, attempt, "sending reliable message");
            transport.send(msg.clone(), Some((*cancel).clone())).await?;

            select! {
                _ = sleep(self.config.reliable_resend_interval) => {}
                _ = cancel.cancelled() => {}
            }
            if self.is_acked(seqnum) {
                return Ok(());
            }
        }

        if cancel.is_cancelled() {
            bail!("sending seqnum {} was cancelled", seqnum);
        }
        warn!(parent: &self.span, seqnum, "reached the maximum resend limit");
        bail!("reached the maximum resend limit for seqnum {}", seqnum)
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) -> anyhow::Result<()> {
        match msg.payload {
            Payload::Ack(ack) => {
                // only seqnums this stream sent are tracked, the ranges themselves are untrusted
                for (seqnum, is_acked) in self.acked().iter_mut() {
                    if ack.contains(*seqnum) {
                        *is_acked = true;
                    }
                }
                Ok(())
            }
            Payload::Bye => {
                self.do_close("received bye from other peer", false).await;
                Ok(())
            }
            payload => {
                if msg.header.reliable {
                    self.send_ack(msg.header.seqnum);
                }

                match self.handler() {
                    Some(handler) => handler.on_payload(payload).await,
                    None => {
                        debug!("no handler registered - dropping payload");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Closes the stream, notifying the other side on a best effort basis. Closing a stream more
    ///  than once has no effect.
    pub async fn close(&self, reason: &str) {
        self.do_close(reason, true).await
    }

    async fn do_close(&self, reason: &str, send_bye: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(parent: &self.span, reason, "closing stream");

        let transport = self.transport.upgrade();
        if let (true, Some(transport)) = (send_bye, &transport) {
            let bye = Message::unreliable(self.local.clone(), self.remote.clone(), Payload::Bye);
            match timeout(self.config.close_timeout, transport.send(bye, Some(self.cancel.clone()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(parent: &self.span, "failed to send bye: {:#}", e),
                Err(_) => warn!(parent: &self.span, "timed out sending bye"),
            }
        }

        self.cancel.cancel();
        if let Some(transport) = transport {
            transport.on_stream_closed(self);
        }

        let handler = self.handler.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handler) = handler {
            handler.on_closed(reason);
        }
    }
}

/// Bridges the stream's delivery queue back to the stream without keeping it alive
struct StreamDispatcher {
    stream: Weak<Stream>,
}

#[async_trait]
impl MessageConsumer for StreamDispatcher {
    async fn on_message(&self, msg: Message) -> anyhow::Result<()> {
        match self.stream.upgrade() {
            Some(stream) => stream.handle_message(msg).await,
            None => Ok(()),
        }
    }
}
