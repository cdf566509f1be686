use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::messaging::endpoint::EndpointIdentity;
use crate::messaging::message::Message;
use crate::messaging::payload::{Payload, Signal};
use crate::transport::config::TransportConfig;
use crate::transport::stream::{Stream, StreamTransport};


/// Stands in for a transport underneath streams: records what the streams send and never
///  delivers anything
#[derive(Default)]
pub struct RecordingStreamTransport {
    sent: Mutex<Vec<Message>>,
    num_closed_streams: AtomicUsize,
}

impl RecordingStreamTransport {
    pub fn new() -> Arc<RecordingStreamTransport> {
        Arc::new(RecordingStreamTransport::default())
    }

    /// a stream on top of this transport
    pub fn stream(self: &Arc<Self>, local: EndpointIdentity, remote: EndpointIdentity) -> Arc<Stream> {
        let transport: Arc<dyn StreamTransport> = self.clone();
        Stream::new(local, remote, Arc::downgrade(&transport), Arc::new(TransportConfig::new()), &Span::none())
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sent_payloads(&self) -> Vec<Payload> {
        self.sent().into_iter()
            .map(|m| m.payload)
            .collect()
    }

    /// distinct signals sent so far, ignoring resends of the same reliable message
    pub fn sent_signals(&self) -> Vec<Signal> {
        let mut seen = Vec::new();
        let mut result = Vec::new();
        for msg in self.sent() {
            if let Payload::Signal(signal) = msg.payload {
                if !seen.contains(&msg.header.seqnum) {
                    seen.push(msg.header.seqnum);
                    result.push(signal);
                }
            }
        }
        result
    }

    pub fn num_closed_streams(&self) -> usize {
        self.num_closed_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for RecordingStreamTransport {
    async fn send(&self, msg: Message, _cancel: Option<CancellationToken>) -> anyhow::Result<()> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push(msg);
        Ok(())
    }

    fn on_stream_closed(&self, _stream: &Stream) {
        self.num_closed_streams.fetch_add(1, Ordering::SeqCst);
    }
}
