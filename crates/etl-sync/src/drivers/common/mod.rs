//! Utilities shared across the datasource drivers.

pub mod tls;

pub use tls::{SslMode, TlsBuilder};
