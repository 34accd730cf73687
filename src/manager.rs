//! Device lifecycle: registry of connections plus the discovery bridge.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::connection::{DeviceConfig, DeviceConnection, DeviceListener};
use crate::discovery::{DeviceInfoSubscriber, DiscoveryListener};
use crate::error::TuyaError;
use crate::keystore::KeyStore;
use crate::message::DeviceInfo;

/// Owns every device connection and wires discovery announcements into
/// address updates. One instance per application.
pub struct DeviceManager {
    discovery: Arc<DiscoveryListener>,
    devices: DashMap<String, ManagedDevice>,
}

struct ManagedDevice {
    connection: DeviceConnection,
    retarget: Arc<dyn DeviceInfoSubscriber>,
}

/// Forwards discovered addresses into the connection.
struct Retarget {
    connection: DeviceConnection,
}

impl DeviceInfoSubscriber for Retarget {
    fn device_info_changed(&self, info: &DeviceInfo) {
        match info.ip.parse::<IpAddr>() {
            Ok(ip) => self.connection.set_address(ip),
            Err(_) => {
                warn!(device = %info.device_id, ip = %info.ip, "unparseable discovered address")
            }
        }
    }
}

impl DeviceManager {
    /// Start a manager with discovery on the standard broadcast ports.
    pub fn new() -> Self {
        Self::with_discovery(DiscoveryListener::spawn())
    }

    pub fn with_discovery(discovery: Arc<DiscoveryListener>) -> Self {
        Self {
            discovery,
            devices: DashMap::new(),
        }
    }

    pub fn discovery(&self) -> &Arc<DiscoveryListener> {
        &self.discovery
    }

    /// Register a device and start its connection task. The connection comes
    /// up on its own once an address is known, either from the config or
    /// from discovery.
    pub fn add_device(
        &self,
        config: DeviceConfig,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<DeviceConnection, TuyaError> {
        let entry = match self.devices.entry(config.device_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TuyaError::DuplicateDevice(config.device_id));
            }
            Entry::Vacant(entry) => entry,
        };

        let device_id = config.device_id.clone();
        let keys = Arc::new(KeyStore::new(config.device_key));
        let connection = DeviceConnection::spawn(config, keys, listener);

        let retarget: Arc<dyn DeviceInfoSubscriber> = Arc::new(Retarget {
            connection: connection.clone(),
        });
        self.discovery.register(device_id.clone(), retarget.clone());

        debug!(device = %device_id, "device registered");
        entry.insert(ManagedDevice {
            connection: connection.clone(),
            retarget,
        });
        Ok(connection)
    }

    /// Tear down and forget a device. Returns false when the id is unknown.
    pub fn remove_device(&self, device_id: &str) -> bool {
        let Some((_, managed)) = self.devices.remove(device_id) else {
            return false;
        };
        self.discovery.unregister(&managed.retarget);
        managed.connection.dispose();
        debug!(device = %device_id, "device removed");
        true
    }

    /// Handle to an already registered device.
    pub fn get(&self, device_id: &str) -> Option<DeviceConnection> {
        self.devices
            .get(device_id)
            .map(|managed| managed.connection.clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|e| e.key().clone()).collect()
    }

    /// Dispose every connection and stop discovery.
    pub fn shutdown(&self) {
        for managed in self.devices.iter() {
            managed.connection.dispose();
        }
        self.devices.clear();
        self.discovery.stop();
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DisconnectReason;
    use crate::frame::Version;
    use crate::message::DpMap;

    struct NullListener;

    impl DeviceListener for NullListener {
        fn on_connected(&self) {}
        fn on_disconnected(&self, _reason: DisconnectReason, _message: &str) {}
        fn on_status(&self, _sub_device: Option<String>, _dps: DpMap) {}
    }

    fn config(id: &str) -> DeviceConfig {
        DeviceConfig::new(id, b"0123456789abcdef", Version::V3_3).unwrap()
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let manager = DeviceManager::with_discovery(DiscoveryListener::spawn_on(0, 0));
        manager
            .add_device(config("dev1"), Arc::new(NullListener))
            .unwrap();
        let err = manager
            .add_device(config("dev1"), Arc::new(NullListener))
            .unwrap_err();
        assert!(matches!(err, TuyaError::DuplicateDevice(id) if id == "dev1"));
        manager.shutdown();
    }

    #[tokio::test]
    async fn removal_frees_the_id() {
        let manager = DeviceManager::with_discovery(DiscoveryListener::spawn_on(0, 0));
        manager
            .add_device(config("dev1"), Arc::new(NullListener))
            .unwrap();
        assert!(manager.get("dev1").is_some());
        assert!(manager.remove_device("dev1"));
        assert!(!manager.remove_device("dev1"));
        assert!(manager.get("dev1").is_none());
        manager
            .add_device(config("dev1"), Arc::new(NullListener))
            .unwrap();
        manager.shutdown();
    }
}
