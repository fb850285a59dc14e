//! Reverse tunnel: a public [`server::Server`] relays sockets accepted on a
//! requested port over one authenticated control link to a private
//! [`client::Client`], which hands them out as ordinary connections.

pub mod addr;
pub mod auth;
pub mod client;
pub mod conn;
pub mod protocol;
pub mod registration;
pub mod server;
pub mod token;
pub mod transport;

pub use client::{Client, ClientError};
pub use conn::VirtualConn;
pub use server::Server;
