//! # virtstate Client
//!
//! Hypervisor API surface for virtstate.
//!
//! This crate defines the contract the engine programs against:
//! - wire types mirroring the server's instance/image objects ([`api`])
//! - the [`InstanceServer`] and [`ImageServer`] traits
//! - asynchronous [`RemoteOperation`] handles for mutating calls
//! - an in-memory [`MockServer`] for tests and development
//!
//! ## Usage
//!
//! ```rust,ignore
//! use virtstate_client::{InstanceServer, MockServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = MockServer::new();
//!     let (instance, _etag) = server.get_instance("web1").await.unwrap();
//! }
//! ```

pub mod api;
pub mod error;
pub mod mock;
pub mod server;

pub use api::*;
pub use error::{ClientError, Result};
pub use mock::MockServer;
pub use server::{CompletedOperation, ImageServer, InstanceServer, Operation, RemoteOperation};
