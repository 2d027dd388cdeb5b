//! Resolves a device UID to the broker-loopback port its reverse tunnel is
//! bound to.
//!
//! Tunnel establishment itself is out of scope (spec.md §1: "the core
//! assumes a known `port` per target device"); this registry is a static
//! table loaded from the broker's config file, the simplest way to satisfy
//! that assumption without inventing a tunnel-registration protocol.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TunnelPorts {
    ports: Arc<HashMap<String, u16>>,
}

impl TunnelPorts {
    pub fn new(ports: HashMap<String, u16>) -> Self {
        Self {
            ports: Arc::new(ports),
        }
    }

    pub fn resolve(&self, device_uid: &str) -> Option<u16> {
        self.ports.get(device_uid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_known_device() {
        let ports = TunnelPorts::new(HashMap::from([("uid-A".to_string(), 2200)]));
        assert_eq!(ports.resolve("uid-A"), Some(2200));
    }

    #[test]
    fn unknown_device_resolves_to_none() {
        let ports = TunnelPorts::new(HashMap::new());
        assert_eq!(ports.resolve("uid-A"), None);
    }
}
