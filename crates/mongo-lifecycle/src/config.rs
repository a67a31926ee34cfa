//! Connection settings.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default maximum number of pooled connections.
pub const DEFAULT_POOL_LIMIT: u32 = 200;

/// Default cursor batch size.
pub const DEFAULT_BATCH: u32 = 50;

/// Default fraction of a batch fetched ahead of consumption.
pub const DEFAULT_PREFETCH: f64 = 0.20;

/// Read/write mode of a session.
///
/// Numbering follows the classic mgo constants so that existing
/// configuration files keep their meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u32")]
pub enum Mode {
    /// Reads may go to any member; no consistency across reads.
    #[default]
    Eventual,
    /// Reads go to a secondary until the first write, then stick to the primary.
    Monotonic,
    /// All operations go to the primary.
    Primary,
    /// Primary when available, otherwise a secondary.
    PrimaryPreferred,
    /// Secondaries only.
    Secondary,
    /// Secondary when available, otherwise the primary.
    SecondaryPreferred,
    /// Lowest-latency member.
    Nearest,
}

impl Mode {
    /// Alias for [`Mode::Primary`].
    pub const STRONG: Mode = Mode::Primary;

    /// The numeric indicator used in configuration.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Eventual => 0,
            Self::Monotonic => 1,
            Self::Primary => 2,
            Self::PrimaryPreferred => 3,
            Self::Secondary => 4,
            Self::SecondaryPreferred => 5,
            Self::Nearest => 6,
        }
    }

    /// Whether reads go to the primary while it is available.
    #[must_use]
    pub fn targets_primary(&self) -> bool {
        matches!(self, Self::Primary | Self::PrimaryPreferred)
    }
}

impl TryFrom<u32> for Mode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Eventual),
            1 => Ok(Self::Monotonic),
            2 => Ok(Self::Primary),
            3 => Ok(Self::PrimaryPreferred),
            4 => Ok(Self::Secondary),
            5 => Ok(Self::SecondaryPreferred),
            6 => Ok(Self::Nearest),
            other => Err(Error::Config(format!("invalid mode: {other}"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eventual => "eventual",
            Self::Monotonic => "monotonic",
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        };
        f.write_str(name)
    }
}

/// User-supplied connection settings.
///
/// Deserializes from the host's configuration with camelCase keys:
///
/// ```text
/// uri = "mongodb://db-1:27017,db-2:27017/app?replicaSet=rs0"
/// db = "app"
/// poolLimit = 100
/// batch = 50
/// prefetch = 0.25
/// mode = 2
/// metrics = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Connection string (required).
    pub uri: String,

    /// Target database name.
    pub db: Option<String>,

    /// Maximum pooled connections; zero means unset.
    pub pool_limit: u32,

    /// Cursor batch size; zero means unset.
    pub batch: u32,

    /// Prefetch ratio in (0, 1]; non-positive means unset.
    pub prefetch: f64,

    /// Read/write mode.
    pub mode: Mode,

    /// Whether to export driver statistics.
    pub metrics: bool,

    /// Metric namespace (may be empty).
    pub metrics_namespace: String,

    /// Metric subsystem (may be empty).
    pub metrics_subsystem: String,
}

impl Settings {
    /// Create settings for the given connection string.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Set the target database.
    #[must_use]
    pub fn db(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Set the pool limit.
    #[must_use]
    pub fn pool_limit(mut self, limit: u32) -> Self {
        self.pool_limit = limit;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub fn batch(mut self, batch: u32) -> Self {
        self.batch = batch;
        self
    }

    /// Set the prefetch ratio.
    #[must_use]
    pub fn prefetch(mut self, prefetch: f64) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the read/write mode.
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable the metrics bridge.
    #[must_use]
    pub fn metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    /// Set the metric namespace and subsystem.
    #[must_use]
    pub fn metrics_prefix(
        mut self,
        namespace: impl Into<String>,
        subsystem: impl Into<String>,
    ) -> Self {
        self.metrics_namespace = namespace.into();
        self.metrics_subsystem = subsystem.into();
        self
    }

    /// Fill unset pool limit, batch and prefetch with their defaults.
    ///
    /// Idempotent. Explicitly set values, mode and URI are left alone.
    pub fn apply_defaults(&mut self) {
        if self.pool_limit == 0 {
            self.pool_limit = DEFAULT_POOL_LIMIT;
        }
        if self.batch == 0 {
            self.batch = DEFAULT_BATCH;
        }
        // NaN counts as unset
        if self.prefetch.is_nan() || self.prefetch <= 0.0 {
            self.prefetch = DEFAULT_PREFETCH;
        }
    }

    /// Consuming form of [`Settings::apply_defaults`].
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.apply_defaults();
        self
    }

    /// Check the settings for configuration faults.
    ///
    /// Meant to run after [`Settings::apply_defaults`]; a zero pool limit or
    /// batch is reported as an error here.
    pub fn validate(&self) -> Result<()> {
        validate_uri(&self.uri)?;

        if self.prefetch.is_nan() || self.prefetch <= 0.0 || self.prefetch > 1.0 {
            return Err(Error::Config(format!(
                "invalid prefetch: {} (must be in (0, 1])",
                self.prefetch
            )));
        }
        if self.pool_limit == 0 {
            return Err(Error::Config("pool limit must be positive".into()));
        }
        if self.batch == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if let Some(db) = &self.db {
            if db.trim().is_empty() {
                return Err(Error::Config("database name cannot be empty".into()));
            }
        }

        Ok(())
    }

    /// The database sessions should use: `db`, else the URI path.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.db.as_deref().or_else(|| database_from_uri(&self.uri))
    }

    /// Options handed to the driver for every session dialed with these settings.
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mode: self.mode,
            pool_limit: self.pool_limit,
            batch: self.batch,
            prefetch: self.prefetch,
        }
    }
}

/// Tuning applied to a session right after it is dialed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Read/write mode.
    pub mode: Mode,
    /// Maximum pooled connections.
    pub pool_limit: u32,
    /// Cursor batch size.
    pub batch: u32,
    /// Prefetch ratio.
    pub prefetch: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Settings::default().with_defaults().session_options()
    }
}

#[allow(clippy::unwrap_used)]
static URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^mongodb(\+srv)?://([^@/?]+@)?([^/?]+)(/[^?]*)?(\?.*)?$").unwrap()
});

/// Validate a MongoDB connection string.
///
/// Accepts `mongodb://` and `mongodb+srv://` URIs with a non-empty,
/// comma-separated host list.
pub fn validate_uri(uri: &str) -> Result<()> {
    if uri.trim().is_empty() {
        return Err(Error::Config("uri is required".into()));
    }

    let caps = URI_RE.captures(uri).ok_or_else(|| {
        Error::Config(format!(
            "invalid uri '{}': expected mongodb:// or mongodb+srv://",
            crate::instrumentation::redact_uri(uri)
        ))
    })?;

    let hosts = caps.get(3).map_or("", |m| m.as_str());
    if hosts.split(',').any(|h| h.trim().is_empty()) {
        return Err(Error::Config(format!(
            "invalid uri '{}': empty host",
            crate::instrumentation::redact_uri(uri)
        )));
    }

    Ok(())
}

/// Extract the database name from the URI path, if any.
fn database_from_uri(uri: &str) -> Option<&str> {
    let caps = URI_RE.captures(uri)?;
    let path = caps.get(4)?.as_str().trim_start_matches('/');
    if path.is_empty() { None } else { Some(path) }
}
