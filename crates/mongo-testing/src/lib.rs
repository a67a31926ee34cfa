//! # mongo-testing
//!
//! Test infrastructure for `mongo-lifecycle`.
//!
//! - [`MockDriver`]: a scriptable in-process driver. Each network operation
//!   can be told to succeed, fail, hang or stall, and every call is counted.
//! - [`MongoContainer`]: a disposable MongoDB server started with
//!   testcontainers, for the end-to-end tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mongo_lifecycle::{ConnectionManager, Settings};
//! use mongo_testing::{Behavior, MockDriver, Operation};
//!
//! let driver = MockDriver::new();
//! driver.on(Operation::Connect, Behavior::Hang);
//!
//! let manager = ConnectionManager::builder("mongo", driver)
//!     .settings(Settings::new("mongodb://localhost:27017"))
//!     .build();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod container;
pub mod error;
pub mod mock;

pub use container::{MongoContainer, uri_from_env};
pub use error::TestingError;
pub use mock::{Behavior, MockClient, MockDriver, Operation};
