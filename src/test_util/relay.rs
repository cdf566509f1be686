use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::messaging::endpoint::{EndpointIdentity, EndpointInfo, DISCOVERY_CONN_ID};
use crate::messaging::message::Message;
use crate::messaging::relay::{IceServer, PrepareResponse, RelayClient};


/// A relay that keeps messages in memory, one queue per recipient identity. Several transports
///  can share one instance to talk to each other. Messages are queued in their wire encoding.
#[derive(Default)]
pub struct InMemoryRelay {
    state: Mutex<RelayState>,
    notify: Notify,
    ice_servers: Vec<IceServer>,
}

#[derive(Default)]
struct RelayState {
    queues: FxHashMap<EndpointIdentity, VecDeque<Bytes>>,
    num_to_drop: usize,
    num_sent: usize,
}

impl InMemoryRelay {
    pub fn new() -> Arc<InMemoryRelay> {
        Arc::new(InMemoryRelay::default())
    }

    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Arc<InMemoryRelay> {
        Arc::new(InMemoryRelay {
            ice_servers,
            ..Default::default()
        })
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// silently lose the next `n` messages that are sent
    pub fn drop_next_messages(&self, n: usize) {
        self.state().num_to_drop = n;
    }

    /// number of messages accepted for delivery, including dropped ones
    pub fn num_sent(&self) -> usize {
        self.state().num_sent
    }

    fn take_messages(&self, info: &EndpointInfo) -> anyhow::Result<Vec<Message>> {
        let mut encoded = Vec::new();
        {
            let mut state = self.state();
            if let Some(queue) = state.queues.get_mut(&info.identity) {
                encoded.extend(queue.drain(..));
            }
            if info.enable_discovery {
                let discovery = EndpointIdentity::discovery(info.identity.group_id.clone(), info.identity.peer_id.clone());
                if let Some(queue) = state.queues.get_mut(&discovery) {
                    encoded.extend(queue.drain(..));
                }
            }
        }

        encoded.into_iter()
            .map(|mut buf| Message::try_deser(&mut buf))
            .collect()
    }
}

#[async_trait]
impl RelayClient for InMemoryRelay {
    async fn prepare(&self) -> anyhow::Result<PrepareResponse> {
        Ok(PrepareResponse {
            ice_servers: self.ice_servers.clone(),
        })
    }

    async fn send(&self, msg: Message) -> anyhow::Result<Vec<Message>> {
        {
            let mut state = self.state();
            state.num_sent += 1;
            if state.num_to_drop > 0 {
                state.num_to_drop -= 1;
                trace!(to = ?msg.header.to, "dropping message");
                return Ok(vec![]);
            }
            let mut buf = BytesMut::new();
            msg.ser(&mut buf);
            state.queues.entry(msg.header.to.clone())
                .or_default()
                .push_back(buf.freeze());
        }
        self.notify.notify_waiters();
        Ok(vec![])
    }

    async fn recv(&self, info: EndpointInfo, timeout: Duration) -> anyhow::Result<Vec<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let msgs = self.take_messages(&info)?;
            if !msgs.is_empty() {
                return Ok(msgs);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(vec![]);
            }
        }
    }
}
