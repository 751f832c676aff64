//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker-backed transports are hidden behind feature
//! flags and exposed only through constructor functions and connectors.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_nats")]
mod nats;

use crate::{ConnectorPtr, Result, SessionError};

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_nats")]
pub use nats::{create_nats_transport, NatsConnector};

/// Pick a connector from the server address scheme.
///
/// - `memory://` → the process-global [`MemoryHub`]
/// - `nats://`, `tls://` → [`NatsConnector`] (requires `transport_nats`)
///
/// # Errors
///
/// Returns `UnsupportedAddress` for unknown schemes or for a scheme whose
/// transport feature is disabled.
pub fn default_connector(server_address: &str) -> Result<ConnectorPtr> {
    // ---
    let scheme = server_address
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or_default();

    match scheme {
        "memory" => Ok(memory::global_hub().connector()),

        #[cfg(feature = "transport_nats")]
        "nats" | "tls" => Ok(std::sync::Arc::new(NatsConnector)),

        #[cfg(not(feature = "transport_nats"))]
        "nats" | "tls" => Err(SessionError::UnsupportedAddress(format!(
            "{server_address} (enable the transport_nats feature)"
        ))),

        _ => Err(SessionError::UnsupportedAddress(server_address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_memory_scheme() {
        assert!(default_connector("memory://").is_ok());
    }

    #[test]
    fn test_unknown_scheme() {
        // ---
        for address in ["mqtt://localhost:1883", "localhost:4222", ""] {
            assert!(matches!(
                default_connector(address),
                Err(SessionError::UnsupportedAddress(_))
            ));
        }
    }
}
