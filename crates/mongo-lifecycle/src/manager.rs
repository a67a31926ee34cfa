//! Connection manager.
//!
//! [`ConnectionManager`] owns at most one live [`Session`] at a time. The
//! session is dialed lazily on first demand (or eagerly by the start phase),
//! shared by reference with every caller, and dropped by the stop phase.
//! After a stop the next [`ConnectionManager::session`] call dials a fresh
//! session, so a manager can go through any number of activations.
//!
//! ```text
//! Unconfigured --post_configure--> Configured --session/connect--> Connected
//!                                                                   |   ^
//!                                                        disconnect |   | session/connect
//!                                                                   v   |
//!                                                               Disconnected
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{SessionOptions, Settings, validate_uri};
use crate::driver::{Client, Driver};
use crate::error::{Error, Result};
use crate::instrumentation::{operation_span, redact_uri, span_names};
use crate::metrics::MetricsBridge;
use crate::stats::Stats;

/// Ceiling for dial, connect, ping and disconnect.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Settings not yet defaulted and validated.
    Unconfigured,
    /// Settings ready, no session yet.
    Configured,
    /// A session exists.
    Connected,
    /// The session was torn down; a new one can be dialed.
    Disconnected,
}

/// A dialed session.
///
/// Handed out as `Arc<Session<_>>`; every caller of
/// [`ConnectionManager::session`] gets the same allocation until the session
/// is torn down.
pub struct Session<C> {
    id: u64,
    client: C,
    options: SessionOptions,
    database: Option<String>,
    uri: String,
    created_at: Instant,
}

impl<C> Session<C> {
    /// Identifier unique within the owning manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The driver client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Options the session was dialed with.
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Database resolved from the settings, if any.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Connection URI with the password redacted.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Time since the session was dialed.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("database", &self.database)
            .field("options", &self.options)
            .finish()
    }
}

/// Manages the lifecycle of a single database session.
///
/// # Example
///
/// ```rust,ignore
/// let manager = ConnectionManager::builder("mongo", driver)
///     .settings(Settings::new("mongodb://localhost:27017/app"))
///     .build();
///
/// let session = manager.session().await?;
/// manager.connect(&CancellationToken::new()).await?;
/// ```
pub struct ConnectionManager<D: Driver> {
    name: String,
    driver: D,
    settings: RwLock<Settings>,
    registry: Registry,
    operation_timeout: Duration,
    verify_on_start: bool,
    session: RwLock<Option<Arc<Session<D::Client>>>>,
    /// Serializes session creation and teardown.
    dial_lock: tokio::sync::Mutex<()>,
    next_session_id: AtomicU64,
    state: Mutex<ManagerState>,
    bridge: Mutex<Option<MetricsBridge>>,
}

impl<D: Driver> ConnectionManager<D> {
    /// Create a manager with default options.
    ///
    /// Settings are empty until [`ConnectionManager::load_settings`] is called;
    /// use [`ConnectionManager::builder`] to supply them up front.
    pub fn new(name: impl Into<String>, driver: D) -> Self {
        Self::builder(name, driver).build()
    }

    /// Start building a manager.
    pub fn builder(name: impl Into<String>, driver: D) -> ManagerBuilder<D> {
        ManagerBuilder::new(name, driver)
    }

    /// Name of this component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The driver backing this manager.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Replace the settings.
    ///
    /// Hosts call this between the pre- and post-configure phases. A live
    /// session keeps the settings it was dialed with.
    pub fn load_settings(&self, settings: Settings) {
        *self.settings.write() = settings;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Registry the metrics bridge is registered with.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ceiling applied to every network operation.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Whether the start phase connects and pings after dialing.
    #[must_use]
    pub fn verify_on_start(&self) -> bool {
        self.verify_on_start
    }

    /// The live session, without dialing one.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<Session<D::Client>>> {
        self.session.read().clone()
    }

    /// Driver counters at this instant.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.driver.stats().snapshot()
    }

    /// Apply defaults to the loaded settings and validate them.
    ///
    /// Configuration faults are fatal.
    pub fn configure(&self) -> Result<()> {
        let settings = {
            let mut settings = self.settings.write();
            settings.apply_defaults();
            settings.clone()
        };
        settings.validate()?;

        let mut state = self.state.lock();
        if matches!(
            *state,
            ManagerState::Unconfigured | ManagerState::Disconnected
        ) {
            *state = ManagerState::Configured;
        }

        tracing::debug!(
            component = %self.name,
            pool_limit = settings.pool_limit,
            batch = settings.batch,
            prefetch = settings.prefetch,
            mode = %settings.mode,
            "settings configured"
        );
        Ok(())
    }

    /// Get the session, dialing it on first use.
    ///
    /// Concurrent first callers share one dial. A dial failure is fatal
    /// ([`Error::Dial`]) and is not retried.
    pub async fn session(&self) -> Result<Arc<Session<D::Client>>> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        let _guard = self.dial_lock.lock().await;
        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        let settings = self.settings().with_defaults();
        validate_uri(&settings.uri)?;

        let uri = redact_uri(&settings.uri);
        let options = settings.session_options();
        let span = operation_span(
            span_names::DIAL,
            &self.name,
            &settings.uri,
            settings.database(),
        );

        let timeout = self.operation_timeout;
        let client = match tokio::time::timeout(
            timeout,
            self.driver.dial(&settings.uri, &options).instrument(span),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(source)) => {
                tracing::error!(component = %self.name, uri = %uri, error = %source, "dial failed");
                return Err(Error::Dial { uri, source });
            }
            Err(_) => {
                tracing::error!(component = %self.name, uri = %uri, ?timeout, "dial timed out");
                return Err(Error::Dial {
                    uri,
                    source: format!("dial timed out after {timeout:?}").into(),
                });
            }
        };

        let session = Arc::new(Session {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            client,
            options,
            database: settings.database().map(str::to_string),
            uri,
            created_at: Instant::now(),
        });

        *self.session.write() = Some(Arc::clone(&session));
        self.set_state(ManagerState::Connected);

        tracing::info!(
            component = %self.name,
            session_id = session.id,
            uri = %session.uri,
            mode = %options.mode,
            pool_limit = options.pool_limit,
            "session created"
        );
        Ok(session)
    }

    /// Connect and ping the primary within one deadline.
    ///
    /// Succeeds without doing anything when no session exists. Failures are
    /// recoverable and are not retried.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(session) = self.current_session() else {
            tracing::debug!(component = %self.name, "no session, skipping connect");
            return Ok(());
        };

        let span = operation_span(
            span_names::CONNECT,
            &self.name,
            &session.uri,
            session.database(),
        );
        let probe = async {
            session
                .client
                .connect()
                .await
                .map_err(|source| Error::Connect {
                    uri: session.uri.clone(),
                    source,
                })?;
            session
                .client
                .ping_primary()
                .await
                .map_err(|source| Error::Ping {
                    uri: session.uri.clone(),
                    source,
                })
        };

        if let Err(e) = self
            .bounded(span_names::CONNECT, cancel, probe.instrument(span))
            .await
        {
            tracing::warn!(component = %self.name, uri = %session.uri, error = %e, "connect failed");
            return Err(e);
        }

        self.set_state(ManagerState::Connected);
        tracing::info!(component = %self.name, uri = %session.uri, "connected to mongodb");
        Ok(())
    }

    /// Probe the primary and return the round-trip time.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<Duration> {
        let session = self.current_session().ok_or(Error::NotConnected)?;

        let span = operation_span(
            span_names::PING,
            &self.name,
            &session.uri,
            session.database(),
        );
        let started = tokio::time::Instant::now();
        self.bounded(
            span_names::PING,
            cancel,
            async {
                session
                    .client
                    .ping_primary()
                    .await
                    .map_err(|source| Error::Ping {
                        uri: session.uri.clone(),
                        source,
                    })
            }
            .instrument(span),
        )
        .await?;

        let latency = started.elapsed();
        tracing::trace!(component = %self.name, ?latency, "ping");
        Ok(latency)
    }

    /// Close the session, if any.
    ///
    /// The session is released even when closing fails, so the next
    /// [`ConnectionManager::session`] call always dials a fresh one.
    pub async fn disconnect(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.dial_lock.lock().await;
        let Some(session) = self.session.write().take() else {
            tracing::debug!(component = %self.name, "no session, skipping disconnect");
            return Ok(());
        };
        self.set_state(ManagerState::Disconnected);

        let span = operation_span(
            span_names::DISCONNECT,
            &self.name,
            &session.uri,
            session.database(),
        );
        let close = async {
            session
                .client
                .disconnect()
                .await
                .map_err(|source| Error::Disconnect {
                    uri: session.uri.clone(),
                    source,
                })
        };

        match self
            .bounded(span_names::DISCONNECT, cancel, close.instrument(span))
            .await
        {
            Ok(()) => {
                tracing::info!(
                    component = %self.name,
                    session_id = session.id,
                    uri = %session.uri,
                    "disconnected from mongodb"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    component = %self.name,
                    session_id = session.id,
                    uri = %session.uri,
                    error = %e,
                    "disconnect failed, session released"
                );
                Err(e)
            }
        }
    }

    /// Register the metrics bridge when the metrics flag is set.
    ///
    /// Registers at most once per activation and returns the registered
    /// bridge. Returns `None` when metrics are disabled.
    pub fn expose_metrics(&self) -> Result<Option<MetricsBridge>> {
        let settings = self.settings();
        if !settings.metrics {
            return Ok(None);
        }

        let mut slot = self.bridge.lock();
        if let Some(bridge) = slot.as_ref() {
            return Ok(Some(bridge.clone()));
        }

        let bridge = MetricsBridge::new(
            &settings.metrics_namespace,
            &settings.metrics_subsystem,
            self.driver.stats(),
        )?;
        self.registry.register(Box::new(bridge.clone()))?;

        tracing::info!(component = %self.name, prefix = %bridge.prefix(), "metrics exposed");
        *slot = Some(bridge.clone());
        Ok(Some(bridge))
    }

    /// Unregister the metrics bridge, ending the activation's registration.
    pub fn withdraw_metrics(&self) {
        let Some(bridge) = self.bridge.lock().take() else {
            return;
        };
        if let Err(e) = self.registry.unregister(Box::new(bridge)) {
            tracing::warn!(component = %self.name, error = %e, "failed to unregister metrics");
        }
    }

    /// The registered metrics bridge, if any.
    #[must_use]
    pub fn metrics_bridge(&self) -> Option<MetricsBridge> {
        self.bridge.lock().clone()
    }

    /// Whether a metrics bridge is currently registered.
    #[must_use]
    pub fn is_metrics_registered(&self) -> bool {
        self.bridge.lock().is_some()
    }

    fn set_state(&self, state: ManagerState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::trace!(component = %self.name, from = ?*current, to = ?state, "state change");
            *current = state;
        }
    }

    /// Run `fut` under the operation timeout, aborting on cancellation.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.operation_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled { operation }),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { operation, timeout }),
            },
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("session", &self.current_session().map(|s| s.id))
            .field("operation_timeout", &self.operation_timeout)
            .field("metrics", &self.is_metrics_registered())
            .finish()
    }
}

/// Builder for [`ConnectionManager`].
pub struct ManagerBuilder<D: Driver> {
    name: String,
    driver: D,
    settings: Settings,
    registry: Option<Registry>,
    operation_timeout: Duration,
    verify_on_start: bool,
}

impl<D: Driver> ManagerBuilder<D> {
    /// Create a builder with default options.
    pub fn new(name: impl Into<String>, driver: D) -> Self {
        Self {
            name: name.into(),
            driver,
            settings: Settings::default(),
            registry: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            verify_on_start: true,
        }
    }

    /// Set the initial settings.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Register metrics with this registry.
    ///
    /// Without one the manager owns a private registry, reachable through
    /// [`ConnectionManager::registry`].
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the ceiling for network operations.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Connect and ping during the start phase (default: true).
    #[must_use]
    pub fn verify_on_start(mut self, enabled: bool) -> Self {
        self.verify_on_start = enabled;
        self
    }

    /// Build the manager.
    pub fn build(self) -> ConnectionManager<D> {
        let registry = self.registry.unwrap_or_else(|| {
            tracing::debug!(component = %self.name, "no registry injected, using a private one");
            Registry::new()
        });

        ConnectionManager {
            name: self.name,
            driver: self.driver,
            settings: RwLock::new(self.settings),
            registry,
            operation_timeout: self.operation_timeout,
            verify_on_start: self.verify_on_start,
            session: RwLock::new(None),
            dial_lock: tokio::sync::Mutex::new(()),
            next_session_id: AtomicU64::new(1),
            state: Mutex::new(ManagerState::Unconfigured),
            bridge: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::driver::BoxError;
    use crate::stats::{DriverStats, StatsSource};
    use async_trait::async_trait;
    use prometheus::Encoder;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingDriver {
        dials: AtomicUsize,
        stats: Arc<DriverStats>,
    }

    struct NullClient;

    #[async_trait]
    impl Client for NullClient {
        async fn connect(&self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
        async fn ping_primary(&self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
        async fn disconnect(&self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Driver for CountingDriver {
        type Client = NullClient;

        async fn dial(
            &self,
            _uri: &str,
            _options: &SessionOptions,
        ) -> std::result::Result<NullClient, BoxError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(NullClient)
        }

        fn stats(&self) -> Arc<dyn StatsSource> {
            self.stats.clone()
        }
    }

    fn manager() -> ConnectionManager<CountingDriver> {
        ConnectionManager::builder("mongo", CountingDriver::default())
            .settings(Settings::new("mongodb://localhost:27017/app").pool_limit(10))
            .registry(Registry::new())
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let manager = ConnectionManager::new("mongo", CountingDriver::default());
        assert_eq!(manager.name(), "mongo");
        assert_eq!(manager.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert!(manager.verify_on_start());
        assert_eq!(manager.state(), ManagerState::Unconfigured);
        assert!(manager.current_session().is_none());
    }

    #[test]
    fn test_configure_applies_defaults() {
        let manager = manager();
        manager.configure().unwrap();

        let settings = manager.settings();
        assert_eq!(settings.pool_limit, 10);
        assert_eq!(settings.batch, crate::config::DEFAULT_BATCH);
        assert_eq!(manager.state(), ManagerState::Configured);
    }

    #[test]
    fn test_configure_rejects_missing_uri() {
        let manager = ConnectionManager::new("mongo", CountingDriver::default());
        let err = manager.configure().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(manager.state(), ManagerState::Unconfigured);
    }

    #[tokio::test]
    async fn test_session_is_shared() {
        let manager = manager();
        let first = manager.session().await.unwrap();
        let second = manager.session().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.driver().dials.load(Ordering::SeqCst), 1);
        assert_eq!(first.options().pool_limit, 10);
        assert_eq!(first.database(), Some("app"));
        assert_eq!(manager.state(), ManagerState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_then_redial() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let first = manager.session().await.unwrap();

        manager.disconnect(&cancel).await.unwrap();
        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert!(manager.current_session().is_none());

        let second = manager.session().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.id() > first.id());
        assert_eq!(manager.driver().dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_without_session_are_noops() {
        let manager = manager();
        let cancel = CancellationToken::new();
        tokio_test::assert_ok!(manager.connect(&cancel).await);
        tokio_test::assert_ok!(manager.disconnect(&cancel).await);
        assert!(matches!(
            manager.ping(&cancel).await,
            Err(Error::NotConnected)
        ));
        assert_eq!(manager.driver().dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_connect() {
        let manager = manager();
        manager.session().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager.connect(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { operation: "mongo.connect" }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_expose_metrics_once() {
        let registry = Registry::new();
        let manager = ConnectionManager::builder("mongo", CountingDriver::default())
            .settings(Settings::new("mongodb://localhost").metrics(true))
            .registry(registry.clone())
            .build();

        let first = manager.expose_metrics().unwrap().unwrap();
        let second = manager.expose_metrics().unwrap().unwrap();
        assert_eq!(first.prefix(), second.prefix());
        assert_eq!(registry.gather().len(), 9);

        manager.withdraw_metrics();
        assert!(!manager.is_metrics_registered());
        assert!(registry.gather().is_empty());
    }

    #[test]
    fn test_private_registry_without_injection() {
        let manager = ConnectionManager::builder("mongo", CountingDriver::default())
            .settings(
                Settings::new("mongodb://localhost")
                    .metrics(true)
                    .metrics_prefix("private", "registry"),
            )
            .build();

        manager.expose_metrics().unwrap();
        assert_eq!(manager.registry().gather().len(), 9);

        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&prometheus::default_registry().gather(), &mut buf)
            .unwrap();
        assert!(!String::from_utf8(buf).unwrap().contains("private_registry_"));
    }

    #[test]
    fn test_expose_metrics_disabled() {
        let manager = manager();
        assert!(manager.expose_metrics().unwrap().is_none());
        assert!(!manager.is_metrics_registered());
    }
}
