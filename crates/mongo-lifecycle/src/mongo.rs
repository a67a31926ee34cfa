//! Backend on the official MongoDB driver.
//!
//! [`MongoDriver`] parses the connection string and applies the pool limit
//! and mode to the driver client. The driver has no client-wide cursor
//! settings, so batch size and prefetch are carried on [`MongoClient`] for
//! callers to pass to their queries. Monitoring events feed a
//! [`DriverStats`] recorder:
//!
//! | Driver event                     | Counter update                    |
//! |----------------------------------|-----------------------------------|
//! | topology opening / closed        | cluster opened / closed           |
//! | connection created / closed      | socket opened / closed, by role   |
//! | checkout started / failed        | socket requested / request failed |
//! | checked out / checked in         | socket acquired / released        |
//! | command started                  | op sent                           |
//! | command succeeded / failed       | op received                       |
//!
//! A connection counts as a master connection when the server it was opened
//! to was last described as writable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use mongodb::event::EventHandler;
use mongodb::event::cmap::CmapEvent;
use mongodb::event::command::CommandEvent;
use mongodb::event::sdam::SdamEvent;
use mongodb::options::{ClientOptions, ReadPreference, SelectionCriteria};
use parking_lot::Mutex;

use crate::config::{Mode, SessionOptions};
use crate::driver::{BoxError, Client, Driver};
use crate::stats::{DriverStats, StatsSource};

/// Map a session mode onto a read preference.
///
/// The driver has no session-consistency modes; `Eventual` reads from the
/// nearest member and `Monotonic` prefers the primary.
#[must_use]
pub fn read_preference(mode: Mode) -> ReadPreference {
    match mode {
        Mode::Primary => ReadPreference::Primary,
        Mode::Monotonic | Mode::PrimaryPreferred => ReadPreference::PrimaryPreferred {
            options: Default::default(),
        },
        Mode::Secondary => ReadPreference::Secondary {
            options: Default::default(),
        },
        Mode::SecondaryPreferred => ReadPreference::SecondaryPreferred {
            options: Default::default(),
        },
        Mode::Eventual | Mode::Nearest => ReadPreference::Nearest {
            options: Default::default(),
        },
    }
}

/// Driver factory for [`mongodb::Client`].
#[derive(Debug, Default)]
pub struct MongoDriver {
    stats: Arc<DriverStats>,
    roles: Arc<RoleTracker>,
}

impl MongoDriver {
    /// Create a driver with fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The counters fed by the driver's monitoring events.
    #[must_use]
    pub fn driver_stats(&self) -> &Arc<DriverStats> {
        &self.stats
    }

    fn install_handlers(&self, options: &mut ClientOptions) {
        let stats = Arc::clone(&self.stats);
        let roles = Arc::clone(&self.roles);
        options.sdam_event_handler = Some(EventHandler::callback(move |event: SdamEvent| {
            match event {
                SdamEvent::TopologyOpening(_) => stats.cluster_opened(),
                SdamEvent::TopologyClosed(_) => stats.cluster_closed(),
                SdamEvent::ServerDescriptionChanged(change) => {
                    let writable = matches!(
                        change.new_description.server_type(),
                        mongodb::ServerType::RsPrimary
                            | mongodb::ServerType::Standalone
                            | mongodb::ServerType::Mongos
                            | mongodb::ServerType::LoadBalancer
                    );
                    roles.server_described(change.address.to_string(), writable);
                }
                _ => {}
            }
        }));

        let stats = Arc::clone(&self.stats);
        let roles = Arc::clone(&self.roles);
        options.cmap_event_handler = Some(EventHandler::callback(move |event: CmapEvent| {
            match event {
                CmapEvent::ConnectionCreated(created) => {
                    let master =
                        roles.connection_created(created.address.to_string(), created.connection_id);
                    stats.socket_opened(master);
                }
                CmapEvent::ConnectionClosed(closed) => {
                    let master =
                        roles.connection_closed(&closed.address.to_string(), closed.connection_id);
                    stats.socket_closed(master);
                }
                CmapEvent::ConnectionCheckoutStarted(_) => stats.socket_requested(),
                CmapEvent::ConnectionCheckoutFailed(_) => stats.socket_request_failed(),
                CmapEvent::ConnectionCheckedOut(_) => stats.socket_acquired(),
                CmapEvent::ConnectionCheckedIn(_) => stats.socket_released(),
                _ => {}
            }
        }));

        let stats = Arc::clone(&self.stats);
        options.command_event_handler = Some(EventHandler::callback(
            move |event: CommandEvent| match event {
                CommandEvent::Started(_) => stats.op_sent(),
                CommandEvent::Succeeded(succeeded) => {
                    stats.op_received(reply_documents(&succeeded.reply));
                }
                CommandEvent::Failed(_) => stats.op_received(0),
                _ => {}
            },
        ));
    }
}

#[async_trait]
impl Driver for MongoDriver {
    type Client = MongoClient;

    async fn dial(&self, uri: &str, options: &SessionOptions) -> Result<MongoClient, BoxError> {
        let mut client_options = ClientOptions::parse(uri).await?;
        let preference = read_preference(options.mode);
        client_options.max_pool_size = Some(options.pool_limit);
        client_options.selection_criteria =
            Some(SelectionCriteria::ReadPreference(preference.clone()));
        self.install_handlers(&mut client_options);

        let client = mongodb::Client::with_options(client_options)?;
        tracing::debug!(
            pool_limit = options.pool_limit,
            mode = %options.mode,
            "mongodb client created"
        );

        Ok(MongoClient {
            client,
            read_preference: preference,
            batch: options.batch,
            prefetch: options.prefetch,
        })
    }

    fn stats(&self) -> Arc<dyn StatsSource> {
        self.stats.clone()
    }
}

/// A dialed [`mongodb::Client`] carrying the session's cursor tuning.
#[derive(Debug, Clone)]
pub struct MongoClient {
    client: mongodb::Client,
    read_preference: ReadPreference,
    batch: u32,
    prefetch: f64,
}

impl MongoClient {
    /// The underlying driver client.
    #[must_use]
    pub fn inner(&self) -> &mongodb::Client {
        &self.client
    }

    /// Handle to a database.
    #[must_use]
    pub fn database(&self, name: &str) -> mongodb::Database {
        self.client.database(name)
    }

    /// Read preference derived from the session mode.
    #[must_use]
    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    /// Cursor batch size for queries issued through this session.
    #[must_use]
    pub fn batch_size(&self) -> u32 {
        self.batch
    }

    /// Prefetch ratio for queries issued through this session.
    #[must_use]
    pub fn prefetch(&self) -> f64 {
        self.prefetch
    }
}

#[async_trait]
impl Client for MongoClient {
    /// Select a server for the session's read preference, then fill the pool.
    async fn connect(&self) -> Result<(), BoxError> {
        self.client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .selection_criteria(SelectionCriteria::ReadPreference(
                self.read_preference.clone(),
            ))
            .await?;
        self.client.warm_connection_pool().await;
        Ok(())
    }

    async fn ping_primary(&self) -> Result<(), BoxError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BoxError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// Tracks which servers are writable and the role each connection was
/// opened with, so that closes decrement the same counter as the open.
#[derive(Debug, Default)]
struct RoleTracker {
    servers: Mutex<HashMap<String, bool>>,
    connections: Mutex<HashMap<(String, u32), bool>>,
}

impl RoleTracker {
    fn server_described(&self, address: String, writable: bool) {
        self.servers.lock().insert(address, writable);
    }

    fn connection_created(&self, address: String, id: u32) -> bool {
        let master = self.servers.lock().get(&address).copied().unwrap_or(false);
        self.connections.lock().insert((address, id), master);
        master
    }

    fn connection_closed(&self, address: &str, id: u32) -> bool {
        self.connections
            .lock()
            .remove(&(address.to_string(), id))
            .unwrap_or(false)
    }
}

/// Number of documents carried by a command reply.
///
/// Cursor replies count their batch; anything else counts as one document.
fn reply_documents(reply: &Document) -> i64 {
    let Ok(cursor) = reply.get_document("cursor") else {
        return 1;
    };
    ["firstBatch", "nextBatch"]
        .iter()
        .find_map(|key| cursor.get_array(key).ok())
        .map_or(0, |batch| batch.len() as i64)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_read_preference_mapping() {
        assert!(matches!(read_preference(Mode::Primary), ReadPreference::Primary));
        assert!(matches!(
            read_preference(Mode::Eventual),
            ReadPreference::Nearest { .. }
        ));
        assert!(matches!(
            read_preference(Mode::Monotonic),
            ReadPreference::PrimaryPreferred { .. }
        ));
        assert!(matches!(
            read_preference(Mode::SecondaryPreferred),
            ReadPreference::SecondaryPreferred { .. }
        ));
    }

    #[tokio::test]
    async fn test_dial_carries_cursor_tuning() {
        let options = SessionOptions {
            mode: Mode::Secondary,
            batch: 25,
            prefetch: 0.5,
            ..SessionOptions::default()
        };
        let client = MongoDriver::new()
            .dial("mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200", &options)
            .await
            .unwrap();

        assert_eq!(client.batch_size(), 25);
        assert!((client.prefetch() - 0.5).abs() < f64::EPSILON);
        assert!(matches!(
            client.read_preference(),
            ReadPreference::Secondary { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_without_reachable_server() {
        let client = MongoDriver::new()
            .dial(
                "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200",
                &SessionOptions::default(),
            )
            .await
            .unwrap();

        assert!(client.connect().await.is_err());
    }

    #[test]
    fn test_reply_documents() {
        assert_eq!(reply_documents(&doc! { "ok": 1 }), 1);
        assert_eq!(
            reply_documents(&doc! { "cursor": { "firstBatch": [{}, {}, {}], "id": 0_i64 } }),
            3
        );
        assert_eq!(
            reply_documents(&doc! { "cursor": { "nextBatch": [{}], "id": 7_i64 } }),
            1
        );
        assert_eq!(reply_documents(&doc! { "cursor": { "id": 0_i64 } }), 0);
    }

    #[test]
    fn test_role_tracker_remembers_open_role() {
        let roles = RoleTracker::default();
        roles.server_described("db-1:27017".into(), true);
        assert!(roles.connection_created("db-1:27017".into(), 1));

        // Demotion after open must not change the close.
        roles.server_described("db-1:27017".into(), false);
        assert!(!roles.connection_created("db-1:27017".into(), 2));
        assert!(roles.connection_closed("db-1:27017", 1));
        assert!(!roles.connection_closed("db-1:27017", 2));
        assert!(!roles.connection_closed("db-2:27017", 9));
    }
}
