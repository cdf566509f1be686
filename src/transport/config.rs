use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::messaging::relay::default_recoverable_predicate;
use crate::util::backoff::{RecoverablePredicate, RetryPolicy};
use crate::util::random::{Random, RngRandom};


#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout the relay is asked to hold a long poll for when there are no messages
    pub poll_timeout: Duration,
    /// Upper bound for every single relay call. This should be somewhat longer than
    ///  `poll_timeout` to give the relay a chance to answer a long poll with an empty response
    ///  rather than being cut off.
    pub rpc_timeout: Duration,

    /// First delay after a recoverable relay failure, doubling with every further failure
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// `None` retries recoverable relay failures indefinitely
    pub max_retries: Option<u32>,

    /// Delay between `Join` probes while connecting to another peer
    pub connect_retry_interval: Duration,

    /// How long a reliable send waits for an ack before it sends the message again
    pub reliable_resend_interval: Duration,
    /// Number of times a reliable message is sent before the send fails
    pub max_reliable_attempts: u32,

    /// Bound on the best-effort `Bye` a stream sends when it is closed
    pub close_timeout: Duration,

    /// Listen on the discovery conn id in addition to our own, i.e. accept connections from
    ///  peers that do not know our conn id yet
    pub enable_discovery: bool,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            poll_timeout: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(65),
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
            max_retries: None,
            connect_retry_interval: Duration::from_secs(1),
            reliable_resend_interval: Duration::from_secs(5),
            max_reliable_attempts: 5,
            close_timeout: Duration::from_secs(1),
            enable_discovery: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_reliable_attempts == 0 {
            bail!("a reliable message must be sent at least once");
        }
        if self.retry_base_delay.is_zero() || self.retry_base_delay > self.retry_max_delay {
            bail!("retry base delay must be positive and not exceed the max delay");
        }
        if self.rpc_timeout < self.poll_timeout {
            bail!("rpc timeout {:?} would cut off long polls of {:?}", self.rpc_timeout, self.poll_timeout);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            max_retries: self.max_retries,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a [crate::transport::transport::Transport] is created from: the local identity
///  (except for the conn id which is chosen randomly), timing and strategies.
#[derive(Clone)]
pub struct TransportOptions {
    pub group_id: String,
    pub peer_id: String,
    pub config: Arc<TransportConfig>,
    pub random: Arc<dyn Random>,
    pub is_recoverable: RecoverablePredicate,
}

impl TransportOptions {
    pub fn new(group_id: impl Into<String>, peer_id: impl Into<String>) -> TransportOptions {
        TransportOptions {
            group_id: group_id.into(),
            peer_id: peer_id.into(),
            config: Arc::new(TransportConfig::new()),
            random: Arc::new(RngRandom {}),
            is_recoverable: default_recoverable_predicate(),
        }
    }

    pub fn with_config(mut self, config: TransportConfig) -> TransportOptions {
        self.config = Arc::new(config);
        self
    }
}
