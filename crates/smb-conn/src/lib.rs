//! Tokio connections for the SMB2/SMB3 wire engine
//!
//! The client side is an [`SmbClient`] handle backed by one driver task per
//! connection. The server side is an [`SmbServer`] listener running one
//! [`ServerConnection`] per socket. Either side works over any
//! `AsyncRead + AsyncWrite` transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use smb_conn::{ServerConfig, SmbServer};
//! # use smb_proto::spnego::Mechanism;
//! # fn mechanisms() -> Vec<Box<dyn Mechanism>> { Vec::new() }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_toml_str(r#"
//!     server_guid = "996e16b1-e7fb-9464-6b35-35057de29f07"
//!     bind_addr = "127.0.0.1:4450"
//! "#)?;
//! let server = SmbServer::new(config, Arc::new(mechanisms));
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod details;
pub mod logging;
pub mod pending;
pub mod server;

pub use client::{NegotiatedSession, Request, SmbClient};
pub use config::{ClientConfig, ConfigError, ConfigResult, ServerConfig};
pub use details::ConnectionDetails;
pub use logging::{init_logging, LogFormat};
pub use server::{
    CoreDispatcher, MechanismFactory, NotSupportedDispatcher, RequestDispatcher,
    ServerConnection, SmbServer,
};
