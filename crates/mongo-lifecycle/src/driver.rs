//! Driver abstraction.
//!
//! The manager never speaks the wire protocol itself. A [`Driver`] turns a
//! connection string into a [`Client`], and the client performs the three
//! network operations the lifecycle needs. The `mongodb` feature provides a
//! backend on the official driver; tests use the scriptable mock from the
//! `mongo-testing` crate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SessionOptions;
use crate::stats::StatsSource;

/// Boxed error returned by driver implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Factory for database clients.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Client type produced by [`Driver::dial`].
    type Client: Client;

    /// Create a client for `uri`.
    ///
    /// Implementations apply the fields of `options` the backend supports to
    /// the returned client and carry the rest on it for callers. Whether this
    /// touches the network is up to the driver; the manager only guarantees
    /// it is called once per session.
    async fn dial(&self, uri: &str, options: &SessionOptions) -> Result<Self::Client, BoxError>;

    /// Counters maintained by this driver.
    fn stats(&self) -> Arc<dyn StatsSource>;
}

/// A live database client.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Establish the underlying network connection.
    async fn connect(&self) -> Result<(), BoxError>;

    /// Probe the primary node.
    async fn ping_primary(&self) -> Result<(), BoxError>;

    /// Close the underlying network connection.
    async fn disconnect(&self) -> Result<(), BoxError>;
}
