//! URL-driven `Server` and `Client` facades for tidenet.
//!
//! The facades parse a URL, pick the transport its scheme maps to and
//! create the engine from `tide-session`, linking their own options node
//! into the engine's so callbacks and limits set on the facade (before or
//! after `start`/`connect`) reach every session.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tide_net::{Client, Configure, Server};
//!
//! # async fn example() -> tide_net::Result<()> {
//! let server = Server::new();
//! server.set_receive_cb(|session, data| {
//!     session.send(data.to_vec());
//!     Ok(data.len())
//! });
//! let local = server.start("tcp://127.0.0.1:0").await?;
//!
//! let client = Client::new();
//! client.connect(&local.to_string()).await?;
//! client.send(&b"ping"[..]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod server;

// Re-export main types
pub use client::Client;
pub use server::Server;

pub use tide_endpoint::{parse, Endpoint, EndpointError, Scheme, Transport, Url};
pub use tide_session::{
    client_config, server_config, AcceptHooks, Configure, Limits, NetError, OptionKey, Options,
    OptionsNode, ParseError, Result, SendCb, Session, SessionEntry, Storage, TlsOptions,
};
