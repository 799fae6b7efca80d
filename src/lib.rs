//! Connector SDK and script-execution engine for remote event-processing
//! sources.
//!
//! The connector opens one persistent WebSocket session per configured
//! source, authenticates with an access token, negotiates the source
//! configuration, and then serves the server's publish/query/notification
//! protocol. Queries carry dynamic scripts, which are compiled once,
//! cached, and executed concurrently; results stream back on the shared
//! socket, correlated by the server's reply address.
//!
//! [`ConnectorSet`] orchestrates all sources of one configuration;
//! [`SourceConnection`] runs a single source's reconnect loop and send
//! primitives; [`ScriptExecConnector`] supplies the script-executing
//! handlers.

pub mod cache;
pub mod config;
pub mod connection;
pub mod connector_set;
pub mod document;
pub mod executor;
pub mod wire;

pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectorContext, ConnectorError, SourceConnection};
pub use connector_set::{ConnectorSet, HealthState};
pub use executor::ScriptExecConnector;
pub use wire::ErrorMessage;
