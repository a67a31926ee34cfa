//! Disposable MongoDB server for end-to-end tests.
//!
//! Tests that need a real server first look at `MONGO_URI`; when it is unset
//! they start a container:
//!
//! ```bash
//! # Against an existing server
//! export MONGO_URI=mongodb://localhost:27017
//!
//! # Or let testcontainers start one (needs Docker)
//! cargo test -p mongo-testing --features mongodb -- --ignored
//! ```

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

use crate::error::TestingError;

/// Image name of the server.
pub const MONGO_IMAGE: &str = "mongo";

/// Image tag of the server.
pub const MONGO_TAG: &str = "7.0";

/// Port the server listens on inside the container.
pub const MONGO_PORT: u16 = 27017;

/// Environment variable pointing at an existing server.
pub const MONGO_URI_ENV: &str = "MONGO_URI";

/// Connection string from [`MONGO_URI_ENV`], if set and non-empty.
#[must_use]
pub fn uri_from_env() -> Option<String> {
    std::env::var(MONGO_URI_ENV)
        .ok()
        .filter(|uri| !uri.trim().is_empty())
}

/// A running MongoDB container.
///
/// The container is removed when this value is dropped.
pub struct MongoContainer {
    container: ContainerAsync<GenericImage>,
    host: String,
    port: u16,
}

impl MongoContainer {
    /// Start a standalone server and wait until it accepts connections.
    pub async fn start() -> Result<Self, TestingError> {
        let container = GenericImage::new(MONGO_IMAGE, MONGO_TAG)
            .with_exposed_port(MONGO_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Waiting for connections"))
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(MONGO_PORT.tcp()).await?;
        tracing::info!(id = %container.id(), %host, port, "mongodb container started");

        Ok(Self {
            container,
            host,
            port,
        })
    }

    /// Connection string without a database.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("mongodb://{}:{}/?directConnection=true", self.host, self.port)
    }

    /// Connection string targeting `database`.
    #[must_use]
    pub fn uri_for(&self, database: &str) -> String {
        format!(
            "mongodb://{}:{}/{database}?directConnection=true",
            self.host, self.port
        )
    }

    /// Container identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.container.id()
    }
}

impl std::fmt::Debug for MongoContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoContainer")
            .field("id", &self.id())
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}
