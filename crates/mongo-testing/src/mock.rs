//! Scriptable mock driver.
//!
//! [`MockDriver`] implements [`Driver`] without a server. Behaviors are read
//! at call time, so a test can change them between operations of the same
//! session. Successful operations feed the shared [`DriverStats`] the way a
//! real driver's monitoring events would:
//!
//! - dial opens a cluster
//! - connect opens one master socket
//! - ping checks a socket out, sends one op, receives one doc, checks it in
//! - disconnect closes the socket and the cluster

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mongo_lifecycle::{BoxError, Client, Driver, DriverStats, SessionOptions, StatsSource};
use parking_lot::Mutex;

use crate::error::TestingError;

/// A scriptable driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Session creation.
    Dial,
    /// Connection establishment.
    Connect,
    /// Primary probe.
    Ping,
    /// Connection close.
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dial => "dial",
            Self::Connect => "connect",
            Self::Ping => "ping",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// What a scripted operation does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Behavior {
    /// Complete immediately.
    #[default]
    Succeed,
    /// Fail with the given message.
    Fail(String),
    /// Never complete.
    Hang,
    /// Complete after the given delay.
    Delay(Duration),
}

impl Behavior {
    /// Shorthand for [`Behavior::Fail`].
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

#[derive(Debug, Default)]
struct Script {
    dial: Behavior,
    connect: Behavior,
    ping: Behavior,
    disconnect: Behavior,
}

impl Script {
    fn slot(&mut self, operation: Operation) -> &mut Behavior {
        match operation {
            Operation::Dial => &mut self.dial,
            Operation::Connect => &mut self.connect,
            Operation::Ping => &mut self.ping,
            Operation::Disconnect => &mut self.disconnect,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: Mutex<Script>,
    dials: AtomicUsize,
    connects: AtomicUsize,
    pings: AtomicUsize,
    disconnects: AtomicUsize,
    last_uri: Mutex<Option<String>>,
    last_options: Mutex<Option<SessionOptions>>,
    stats: Arc<DriverStats>,
}

impl MockState {
    fn behavior(&self, operation: Operation) -> Behavior {
        self.script.lock().slot(operation).clone()
    }

    fn counter(&self, operation: Operation) -> &AtomicUsize {
        match operation {
            Operation::Dial => &self.dials,
            Operation::Connect => &self.connects,
            Operation::Ping => &self.pings,
            Operation::Disconnect => &self.disconnects,
        }
    }

    /// Count the call, then play its behavior.
    async fn perform(&self, operation: Operation) -> Result<(), BoxError> {
        self.counter(operation).fetch_add(1, Ordering::SeqCst);
        match self.behavior(operation) {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(message) => {
                tracing::debug!(%operation, %message, "mock failure");
                Err(TestingError::Scripted { operation, message }.into())
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// In-process [`Driver`] with scriptable behaviors.
///
/// Clones share script, counters and statistics.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    /// Create a driver whose operations all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior of an operation.
    pub fn on(&self, operation: Operation, behavior: Behavior) -> &Self {
        *self.state.script.lock().slot(operation) = behavior;
        self
    }

    /// Number of times `operation` was invoked.
    #[must_use]
    pub fn calls(&self, operation: Operation) -> usize {
        self.state.counter(operation).load(Ordering::SeqCst)
    }

    /// URI passed to the most recent dial.
    #[must_use]
    pub fn last_uri(&self) -> Option<String> {
        self.state.last_uri.lock().clone()
    }

    /// Options passed to the most recent dial.
    #[must_use]
    pub fn last_options(&self) -> Option<SessionOptions> {
        *self.state.last_options.lock()
    }

    /// The counters this driver feeds.
    #[must_use]
    pub fn driver_stats(&self) -> &Arc<DriverStats> {
        &self.state.stats
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Client = MockClient;

    async fn dial(&self, uri: &str, options: &SessionOptions) -> Result<MockClient, BoxError> {
        *self.state.last_uri.lock() = Some(uri.to_string());
        *self.state.last_options.lock() = Some(*options);

        self.state.perform(Operation::Dial).await?;
        self.state.stats.cluster_opened();

        Ok(MockClient {
            state: Arc::clone(&self.state),
            socket_open: AtomicBool::new(false),
        })
    }

    fn stats(&self) -> Arc<dyn StatsSource> {
        self.state.stats.clone()
    }
}

/// Client produced by [`MockDriver`].
#[derive(Debug)]
pub struct MockClient {
    state: Arc<MockState>,
    socket_open: AtomicBool,
}

impl MockClient {
    /// Whether a successful connect has opened the mock socket.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.socket_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Client for MockClient {
    async fn connect(&self) -> Result<(), BoxError> {
        self.state.perform(Operation::Connect).await?;
        if !self.socket_open.swap(true, Ordering::SeqCst) {
            self.state.stats.socket_opened(true);
        }
        Ok(())
    }

    async fn ping_primary(&self) -> Result<(), BoxError> {
        let stats = &self.state.stats;
        stats.socket_requested();
        if let Err(e) = self.state.perform(Operation::Ping).await {
            stats.socket_request_failed();
            return Err(e);
        }
        stats.socket_acquired();
        stats.op_sent();
        stats.op_received(1);
        stats.socket_released();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BoxError> {
        self.state.perform(Operation::Disconnect).await?;
        if self.socket_open.swap(false, Ordering::SeqCst) {
            self.state.stats.socket_closed(true);
        }
        self.state.stats.cluster_closed();
        Ok(())
    }
}
