//! rftp library
//!
//! A small file transfer protocol over TCP: length-prefixed control messages,
//! raw streamed file bodies, and a server confined to one directory tree.

pub mod cli;
pub mod client;
pub mod config;
pub mod confine;
pub mod error;
pub mod locks;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{FtpError, Result};
pub use protocol::{Command, Message, Response};
pub use server::Server;
