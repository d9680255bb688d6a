//! bridgemail is a local-only mail service: agents on this host submit
//! mail over SMTP, clients on this host read and delete it over POP3,
//! and both protocols share one SQLite store of mailboxes and messages.
//!
//! The crate splits along the wire: `bridgemail-smtp` and
//! `bridgemail-pop3` hold the pure protocol types, while this crate
//! owns the store, the per-session engines and the multiplexer that
//! drives them.

pub mod config;
pub mod framer;
pub mod pop3;
pub mod registry;
pub mod server;
pub mod smtp;
pub mod store;

pub use config::Config;
pub use server::Server;
pub use store::Store;
