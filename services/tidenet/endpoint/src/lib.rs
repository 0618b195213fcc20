//! URL parsing, scheme dispatch and name resolution for tidenet.
//!
//! Every facade call that takes an address takes a URL of the form
//! `scheme://host[:port][/path]`. This crate turns that string into a
//! resolved [`Endpoint`] and tells the caller which transport the scheme
//! maps to.
//!
//! ## Schemes
//!
//! ```text
//! +---------+-----------+--------+
//! | scheme  | transport | secure |
//! +---------+-----------+--------+
//! | tcp     | tcp       | no     |
//! | tls/ssl | tcp       | yes    |
//! | http    | tcp       | no     |
//! | https   | tcp       | no     |
//! | udp     | udp       | no     |
//! +---------+-----------+--------+
//! ```
//!
//! A missing port means "ephemeral": the listener reports the port the OS
//! picked through its local-address query once started.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod error;
pub mod scheme;

// Re-export main types
pub use endpoint::{parse, Endpoint, Url};
pub use error::EndpointError;
pub use scheme::{Scheme, Transport};
