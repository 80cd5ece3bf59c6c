//! eventmux - shared-connection business-event subscription client
//!
//! Lets many independent UI components subscribe to server-pushed business
//! events over MQTT without each component owning its own broker
//! connection. One process hosts one shared transport; per-component
//! [`Worker`]s multiplex subscriptions on top of it; a reference-counted
//! [`interest::InterestRegistry`] ensures the backend is told exactly once
//! when a business becomes (un)interesting across every realm sharing the
//! cache.
//!
//! # Overview
//!
//! - [`http`] - structured request/response with middleware chains and
//!   in-flight GET coalescing
//! - [`cache`] - namespaced persistent + in-memory key-value store with
//!   per-key write/delete policy
//! - [`locator`] - scoped dependency registry wiring the singletons
//! - [`transport`] - the shared MQTT channel: direct broker connection, or
//!   a port onto the cross-tab shared host
//! - [`interest`] - cross-tab reference counter for `(subject, bid)` pairs
//! - [`worker`] - per-component subscription multiplexer
//! - [`service`] - lifecycle state machine and credentials assembly
//!
//! # Quick Start
//!
//! ```no_run
//! use eventmux::cache::{Cache, FileStorage, PersistentCache};
//! use eventmux::config::ServiceConfig;
//! use eventmux::http::HttpClient;
//! use eventmux::interest::InterestRegistry;
//! use eventmux::protocol::Business;
//! use eventmux::service::{Service, TransportMode};
//! use eventmux::transport::RumqttcConnector;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::load_from_file("eventmux.toml".as_ref())?;
//! let storage = Arc::new(FileStorage::new("cache.json"));
//! let cache: Arc<dyn Cache> = Arc::new(PersistentCache::new(storage));
//! let http = HttpClient::new(&config.http, cache.clone())?;
//! let registry = Arc::new(InterestRegistry::new(cache.clone()));
//!
//! let service = Service::new(
//!     config,
//!     cache,
//!     http,
//!     registry,
//!     Arc::new(RumqttcConnector::new()),
//!     TransportMode::Direct,
//! );
//! service.init().await?;
//!
//! let worker = service.create_worker(None)?;
//! worker.watch(&Business::new("log/detail", "B1")).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod interest;
pub mod locator;
pub mod observability;
pub mod protocol;
pub mod service;
pub mod testing;
pub mod transport;
pub mod worker;

pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};
pub use http::HttpClient;
pub use interest::InterestRegistry;
pub use locator::ServiceLocator;
pub use protocol::{Business, TopicScheme};
pub use service::{BrowserHooks, Service, ServiceState, TransportMode};
pub use transport::{Transport, TransportEvent, TransportProfile};
pub use worker::Worker;
