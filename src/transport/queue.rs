use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{error, trace, Instrument, Span};

use crate::messaging::message::Message;


/// Receives the messages of a [DeliveryQueue], one at a time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    async fn on_message(&self, msg: Message) -> anyhow::Result<()>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Enqueued {
    Queued,
    /// a reliable message whose seqnum is already pending or was delivered before
    Duplicate,
}

/// Inbound queue of a single stream. Reliable messages are deduplicated by seqnum and delivered
///  in the order they first arrived, unreliable messages are delivered without dedup and take
///  precedence (newest first). At most one message is being delivered at any given time.
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    consumer: Arc<dyn MessageConsumer>,
    span: Span,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u32, Instant, Message)>,
    pending_seqnums: FxHashSet<u32>,
    /// permanent record of delivered reliable seqnums
    emitted: FxHashMap<u32, Instant>,
    unreliable_backlog: Vec<Message>,
    processing: bool,
}

impl QueueState {
    fn push(&mut self, msg: Message) -> Enqueued {
        if !msg.header.reliable {
            self.unreliable_backlog.push(msg);
            return Enqueued::Queued;
        }

        let seqnum = msg.header.seqnum;
        if self.emitted.contains_key(&seqnum) || !self.pending_seqnums.insert(seqnum) {
            return Enqueued::Duplicate;
        }
        self.pending.push_back((seqnum, Instant::now(), msg));
        Enqueued::Queued
    }

    /// Picks the next message for delivery and marks the queue as busy, or returns `None` if
    ///  there is nothing to deliver or a delivery is already in progress
    fn start_next(&mut self) -> Option<Message> {
        if self.processing {
            return None;
        }
        let next = self.take_next();
        self.processing = next.is_some();
        next
    }

    /// Called after a delivery completes: hands out the next message or marks the queue as idle
    fn continue_next(&mut self) -> Option<Message> {
        let next = self.take_next();
        self.processing = next.is_some();
        next
    }

    fn take_next(&mut self) -> Option<Message> {
        if let Some(msg) = self.unreliable_backlog.pop() {
            return Some(msg);
        }

        let (seqnum, received_at, msg) = self.pending.pop_front()?;
        self.pending_seqnums.remove(&seqnum);
        self.emitted.insert(seqnum, received_at);
        Some(msg)
    }
}

impl DeliveryQueue {
    pub fn new(consumer: Arc<dyn MessageConsumer>, span: Span) -> Arc<DeliveryQueue> {
        Arc::new(DeliveryQueue {
            state: Default::default(),
            consumer,
            span,
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(self: &Arc<Self>, msg: Message) -> Enqueued {
        let result = self.state().push(msg);
        if result == Enqueued::Duplicate {
            trace!(parent: &self.span, "duplicate reliable message - ignoring");
        }
        self.process_next();
        result
    }

    pub fn is_emitted(&self, seqnum: u32) -> bool {
        self.state().emitted.contains_key(&seqnum)
    }

    pub fn num_pending(&self) -> usize {
        let state = self.state();
        state.pending.len() + state.unreliable_backlog.len()
    }

    fn process_next(self: &Arc<Self>) {
        let next = self.state().start_next();
        if let Some(msg) = next {
            let queue = self.clone();
            tokio::spawn(queue.deliver(msg).instrument(self.span.clone()));
        }
    }

    async fn deliver(self: Arc<Self>, first: Message) {
        let mut msg = first;
        loop {
            trace!(seqnum = msg.header.seqnum, reliable = msg.header.reliable, "delivering message");
            if let Err(e) = self.consumer.on_message(msg).await {
                error!("error handling message: {:#}", e);
            }

            let next = self.state().continue_next();
            match next {
                Some(m) => msg = m,
                None => break,
            }
        }
    }
}
