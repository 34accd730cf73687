//! UDP device discovery.
//!
//! Devices broadcast their presence periodically: plaintext frames on one
//! port and frames encrypted with the shared UDP key on another. Both
//! carry the same framing as TCP, so the regular decoder applies. The
//! listener keeps a registry of everything seen and notifies subscribers
//! whenever a device's announcement changes.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::FrameDecoder;
use crate::constants::{BIND_RETRY_DELAY, UDP_PORT_ENCRYPTED, UDP_PORT_PLAIN};
use crate::message::{DeviceInfo, Message};

const DATAGRAM_CAPACITY: usize = 2048;

/// Callback for device announcements. Invoked from the listener task; must
/// not block.
pub trait DeviceInfoSubscriber: Send + Sync + 'static {
    fn device_info_changed(&self, info: &DeviceInfo);
}

/// Passive listener on the discovery broadcast ports.
pub struct DiscoveryListener {
    registry: DashMap<String, DeviceInfo>,
    subscribers: DashMap<String, Arc<dyn DeviceInfoSubscriber>>,
    cancel: CancellationToken,
}

impl DiscoveryListener {
    /// Create a listener and start its socket tasks on the standard ports.
    pub fn spawn() -> Arc<Self> {
        Self::spawn_on(UDP_PORT_PLAIN, UDP_PORT_ENCRYPTED)
    }

    pub fn spawn_on(plain_port: u16, encrypted_port: u16) -> Arc<Self> {
        let listener = Arc::new(Self {
            registry: DashMap::new(),
            subscribers: DashMap::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(listen_loop(listener.clone(), plain_port, encrypted_port));
        listener
    }

    /// Subscribe to announcements for one device. If the device was already
    /// seen the subscriber is notified immediately with the cached info.
    pub fn register(&self, device_id: impl Into<String>, subscriber: Arc<dyn DeviceInfoSubscriber>) {
        let device_id = device_id.into();
        if let Some(info) = self.registry.get(&device_id) {
            subscriber.device_info_changed(&info);
        }
        self.subscribers.insert(device_id, subscriber);
    }

    /// Remove a specific subscriber. A different subscriber registered under
    /// the same device id in the meantime stays.
    pub fn unregister(&self, subscriber: &Arc<dyn DeviceInfoSubscriber>) {
        self.subscribers
            .retain(|_, existing| !Arc::ptr_eq(existing, subscriber));
    }

    /// Last announcement seen for a device, if any.
    pub fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        self.registry.get(device_id).map(|info| info.clone())
    }

    /// Stop the socket tasks. The registry stays readable.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Process one discovery datagram. Undecodable datagrams are logged and
    /// ignored; foreign traffic on these ports is common.
    pub fn handle_datagram(&self, datagram: &[u8]) {
        let decoder = FrameDecoder::for_discovery();
        let mut buf = BytesMut::from(datagram);
        let Some(frame) = decoder.decode_frame(&mut buf) else {
            trace!(len = datagram.len(), "datagram without a complete frame");
            return;
        };
        let info = match decoder.decode_message(&frame) {
            Ok(Message::Discovery { info, .. }) => info,
            Ok(other) => {
                debug!(command = ?other.command(), "non-discovery message on discovery port");
                return;
            }
            Err(e) => {
                debug!(error = %e, "undecodable discovery datagram");
                return;
            }
        };

        let changed = match self.registry.insert(info.device_id.clone(), info.clone()) {
            Some(previous) => previous != info,
            None => true,
        };
        if !changed {
            return;
        }
        info!(device = %info.device_id, ip = %info.ip, version = %info.version, "device announced");
        if let Some(subscriber) = self.subscribers.get(&info.device_id) {
            subscriber.device_info_changed(&info);
        }
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Single socket task driving both ports. A bind or receive failure on
/// either port tears down both sockets and rebinds them together after a
/// fixed delay.
async fn listen_loop(listener: Arc<DiscoveryListener>, plain_port: u16, encrypted_port: u16) {
    let cancel = listener.cancel.clone();
    let mut plain_buf = vec![0u8; DATAGRAM_CAPACITY];
    let mut encrypted_buf = vec![0u8; DATAGRAM_CAPACITY];
    loop {
        let bound = tokio::select! {
            _ = cancel.cancelled() => return,
            res = bind_both(plain_port, encrypted_port) => res,
        };
        let (plain, encrypted) = match bound {
            Ok(pair) => pair,
            Err(e) => {
                warn!(plain_port, encrypted_port, error = %e, "discovery bind failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(BIND_RETRY_DELAY) => continue,
                }
            }
        };
        debug!(plain_port, encrypted_port, "discovery listeners bound");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = plain.recv_from(&mut plain_buf) => match res {
                    Ok((len, _peer)) => listener.handle_datagram(&plain_buf[..len]),
                    Err(e) => {
                        warn!(port = plain_port, error = %e, "discovery receive failed, rebinding both ports");
                        break;
                    }
                },
                res = encrypted.recv_from(&mut encrypted_buf) => match res {
                    Ok((len, _peer)) => listener.handle_datagram(&encrypted_buf[..len]),
                    Err(e) => {
                        warn!(port = encrypted_port, error = %e, "discovery receive failed, rebinding both ports");
                        break;
                    }
                },
            }
        }
        // Both sockets drop here before the rebind attempt.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(BIND_RETRY_DELAY) => {}
        }
    }
}

/// Bind both discovery ports, all or nothing.
async fn bind_both(plain_port: u16, encrypted_port: u16) -> io::Result<(UdpSocket, UdpSocket)> {
    let plain = UdpSocket::bind(("0.0.0.0", plain_port)).await?;
    let encrypted = UdpSocket::bind(("0.0.0.0", encrypted_port)).await?;
    Ok((plain, encrypted))
}
