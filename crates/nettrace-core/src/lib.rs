//! nettrace core - connection types, wire codec, and configuration
//!
//! This crate provides the foundational types shared by the tracer crates:
//!
//! - **Connection**: connection records, keys, and NAT translations
//! - **Codec**: the `{"connections": [...]}` wire format
//! - **Config**: TOML configuration with environment overrides
//! - **Translation**: the seam through which conntrack data is looked up

pub mod codec;
pub mod config;
pub mod connection;
pub mod translation;

// Re-export commonly used types
pub use codec::{decode, decode_stream, encode, CodecError, EncodeOptions};
pub use config::{ConfigLoader, TracerConfig};
pub use connection::{
    Address, ConnectionDirection, ConnectionFamily, ConnectionKey, ConnectionRecord,
    ConnectionType, Connections, IPTranslation, ListeningPorts,
};
pub use translation::{TranslationError, TranslationSource};

/// Tracer version
pub const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");
