//! Host lifecycle hooks.
//!
//! A host framework drives each component through four ordered phases:
//!
//! 1. `pre_configure`: before settings are loaded
//! 2. `post_configure`: settings loaded; default, validate, expose metrics
//! 3. `start`: dial the session and verify the primary
//! 4. `stop`: close the session and withdraw metrics
//!
//! Hooks return [`Error`](crate::Error); the host inspects
//! [`Error::severity`](crate::Error::severity) to decide whether to abort.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;
use crate::error::Result;
use crate::manager::ConnectionManager;

/// A component managed by the host lifecycle.
///
/// Object safe, so hosts can hold `Box<dyn Component>` collections.
#[async_trait]
pub trait Component: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs before the host loads settings.
    async fn pre_configure(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once settings are loaded.
    async fn post_configure(&self) -> Result<()>;

    /// Bring the component up.
    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    /// Tear the component down.
    async fn stop(&self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl<D: Driver> Component for ConnectionManager<D> {
    fn name(&self) -> &str {
        ConnectionManager::name(self)
    }

    async fn post_configure(&self) -> Result<()> {
        self.configure()?;
        self.expose_metrics()?;
        Ok(())
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let session = self.session().await?;
        tracing::debug!(component = %self.name(), session_id = session.id(), "starting");

        if self.verify_on_start() {
            self.connect(cancel).await?;
        }
        Ok(())
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.disconnect(cancel).await;
        self.withdraw_metrics();
        result
    }
}

