//! Session engine and connection lifecycles for tidenet.
//!
//! A [`TcpSession`] owns one connected TCP or TLS socket and runs two
//! tasks over it: a receive pipeline that feeds a growable buffer to the
//! application's receive callback, and a send pipeline that writes queued
//! messages in submission order with vectored writes. [`TcpServer`] and
//! [`TcpClient`] create sessions on the listening and connecting sides;
//! [`UdpPeer`] offers the same callback shape over datagrams.
//!
//! ## Features
//!
//! - **Sticky errors**: the first failure on a session is the one every
//!   pending send and the disconnected callback sees
//! - **Half-close state machine**: each side closes independently and the
//!   disconnected callback fires exactly once, last
//! - **Backpressure**: bounded send queue (`SendOverflow`) and per-message
//!   send timeouts that never cut a partially written message
//! - **Fast path**: `send_no_delay` writes inline when nothing is in flight
//! - **Options tree**: settings on a facade cascade into its engines
//!
//! ## Example
//!
//! ```rust,no_run
//! use tide_endpoint::{Endpoint, Scheme};
//! use tide_session::{Configure, TcpServer};
//!
//! # async fn example() -> tide_session::Result<()> {
//! let server = TcpServer::new();
//! server
//!     .set_max_connections(1024)
//!     .set_receive_cb(|session, data| {
//!         session.send(data.to_vec());
//!         Ok(data.len())
//!     });
//!
//! let ep = Endpoint::new("127.0.0.1:0".parse().unwrap(), Scheme::Tcp);
//! let local = server.start(&ep).await?;
//! println!("echoing on {}", local);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffer;
pub mod client;
pub mod entry;
pub mod error;
mod message;
pub mod options;
pub mod server;
pub mod session;
pub mod transport;
pub mod udp;

// Re-export main types
pub use client::TcpClient;
pub use entry::{SendCb, Session, SessionEntry, Storage};
pub use error::{NetError, Result};
pub use options::{
    AcceptHook, AcceptHooks, Configure, ConnectedCb, DisconnectedCb, Limits, LinkError, OnSetHook,
    OptionKey, Options, OptionsNode, ParseError, ReceiveCb, TlsOptions,
};
pub use server::TcpServer;
pub use session::TcpSession;
pub use transport::tls::{client_config, server_config};
pub use transport::IoStream;
pub use udp::UdpPeer;
