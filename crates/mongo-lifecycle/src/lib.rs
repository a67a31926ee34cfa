//! # mongo-lifecycle
//!
//! Lifecycle-managed MongoDB session with Prometheus export of the driver's
//! connection statistics.
//!
//! The crate is meant to be embedded into a host service framework that
//! drives components through ordered phases (pre-configure, post-configure,
//! start, stop). It owns exactly one lazily-dialed session per manager and
//! republishes the driver's internal counters as nine gauges.
//!
//! ## Features
//!
//! - **Lazy, exactly-once session creation**: concurrent first callers share
//!   a single dial
//! - **Configuration defaulting**: pool limit, batch size and prefetch ratio
//!   get sensible defaults without overwriting explicit values
//! - **Bounded network calls**: connect, ping and disconnect are raced
//!   against a fixed timeout and a caller cancellation token
//! - **Two-tier errors**: every [`Error`] carries a [`Severity`] so the host
//!   can tell fatal faults from recoverable ones
//! - **Prometheus bridge**: [`MetricsBridge`] implements
//!   [`prometheus::core::Collector`] with bit-exact metric names
//! - **`mongodb` feature**: a real backend on the official driver
//!
//! ## Example
//!
//! ```rust,ignore
//! use mongo_lifecycle::{Component, ConnectionManager, Settings};
//! use mongo_lifecycle::mongo::MongoDriver;
//! use tokio_util::sync::CancellationToken;
//!
//! let settings = Settings::new("mongodb://localhost:27017/app").metrics(true);
//! let manager = ConnectionManager::builder("mongo", MongoDriver::new())
//!     .settings(settings)
//!     .registry(registry.clone())
//!     .build();
//!
//! let cancel = CancellationToken::new();
//! manager.pre_configure().await?;
//! manager.post_configure().await?;
//! manager.start(&cancel).await?;
//!
//! let session = manager.session().await?;
//! let db = session.client().database(session.database().unwrap_or("test"));
//!
//! manager.stop(&cancel).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod driver;
pub mod error;
pub mod instrumentation;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod stats;

#[cfg(feature = "mongodb")]
pub mod mongo;

// Configuration
pub use config::{Mode, SessionOptions, Settings};

// Error types
pub use error::{Error, Result, Severity};

// Driver seam
pub use driver::{BoxError, Client, Driver};

// Lifecycle management
pub use lifecycle::Component;
pub use manager::{ConnectionManager, ManagerBuilder, ManagerState, Session};

// Statistics and metrics
pub use metrics::MetricsBridge;
pub use stats::{DriverStats, Stats, StatsSource};

/// Re-export of the cancellation token accepted by the network operations.
pub use tokio_util::sync::CancellationToken;
