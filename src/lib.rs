pub mod codec;
pub mod connection;
pub mod constants;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod heartbeat;
pub mod keystore;
pub mod manager;
pub mod message;

// Re-export the types most applications touch.
pub use connection::{
    ConnectionState, DeviceConfig, DeviceConnection, DeviceListener, DisconnectReason,
};
pub use discovery::{DeviceInfoSubscriber, DiscoveryListener};
pub use error::TuyaError;
pub use frame::{CommandType, Frame, Version};
pub use manager::DeviceManager;
pub use message::{DeviceInfo, DpMap, Message};
