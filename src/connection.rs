//! Per-device connection state machine.
//!
//! Each device gets one background task owning the TCP stream. The task
//! drives `DISCONNECTED → CONNECTING → (HANDSHAKING →) ESTABLISHED`,
//! schedules a single delayed reconnect after unexpected drops, and invokes
//! the upward [`DeviceListener`] callbacks. Commands reach the task through
//! a bounded channel so all writes stay serialized on one stream.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{FrameDecoder, FrameEncoder};
use crate::constants::{
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, KEY_SIZE, RECONNECT_DELAY, TCP_PORT,
};
use crate::error::TuyaError;
use crate::frame::{CommandType, Version};
use crate::handshake::SessionHandshake;
use crate::heartbeat::{CloseCause, HeartbeatAction, HeartbeatMonitor};
use crate::keystore::KeyStore;
use crate::message::{DpMap, Message};

/// Static per-device configuration, provided by the lifecycle layer.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_key: [u8; KEY_SIZE],
    pub version: Version,
    /// `None` means the address is resolved through UDP discovery.
    pub address: Option<IpAddr>,
    pub port: u16,
}

impl DeviceConfig {
    pub fn new(
        device_id: impl Into<String>,
        device_key: &[u8],
        version: Version,
    ) -> Result<Self, TuyaError> {
        let device_key: [u8; KEY_SIZE] =
            device_key
                .try_into()
                .map_err(|_| TuyaError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: device_key.len(),
                })?;
        Ok(Self {
            device_id: device_id.into(),
            device_key,
            version,
            address: None,
            port: TCP_PORT,
        })
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Established,
}

/// Why a connection ended, as reported through `on_disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectFailed,
    Transport,
    ReadIdle,
    HeartbeatLost,
    HandshakeFailed,
    Decryption,
    AddressChanged,
    Disposed,
}

impl DisconnectReason {
    pub fn code(self) -> u32 {
        match self {
            DisconnectReason::ConnectFailed => 1,
            DisconnectReason::Transport => 2,
            DisconnectReason::ReadIdle => 3,
            DisconnectReason::HeartbeatLost => 4,
            DisconnectReason::HandshakeFailed => 5,
            DisconnectReason::Decryption => 6,
            DisconnectReason::AddressChanged => 7,
            DisconnectReason::Disposed => 8,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Upward callbacks, invoked from the connection task. Implementations must
/// not block.
pub trait DeviceListener: Send + Sync + 'static {
    fn on_connected(&self);
    fn on_disconnected(&self, reason: DisconnectReason, message: &str);
    fn on_status(&self, sub_device: Option<String>, dps: DpMap);
}

enum Command {
    Control(DpMap),
    Status,
    Refresh(Vec<u32>),
    Retarget(IpAddr),
}

/// Handle to one device connection. Cloneable; all clones drive the same
/// background task. Operations are fire-and-forget and never block.
#[derive(Clone, Debug)]
pub struct DeviceConnection {
    device_id: String,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl DeviceConnection {
    /// Spawn the background task for this device. The key store is owned by
    /// the caller (the device manager keeps an explicit registry).
    pub fn spawn(
        config: DeviceConfig,
        keys: Arc<KeyStore>,
        listener: Arc<dyn DeviceListener>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let handle = Self {
            device_id: config.device_id.clone(),
            tx,
            state: state_rx,
            cancel: cancel.clone(),
        };

        let task = ConnectionTask {
            address: config.address,
            encoder: FrameEncoder::new(config.version, config.device_id.clone(), keys.clone()),
            decoder: FrameDecoder::new(config.version, keys.clone(), true),
            config,
            keys,
            listener,
            rx,
            state_tx,
            cancel,
        };
        tokio::spawn(task.run());
        handle
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions (useful for tests and diagnostics).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Set data points on the device. Dropped with a warning when no
    /// transport is established; commands are never queued.
    pub fn send_control(&self, dps: DpMap) {
        self.submit(Command::Control(dps), "send_control");
    }

    /// Ask the device to report its full status.
    pub fn request_status(&self) {
        self.submit(Command::Status, "request_status");
    }

    /// Ask the device to re-report the given data points.
    pub fn refresh_status(&self, dp_ids: Vec<u32>) {
        self.submit(Command::Refresh(dp_ids), "refresh_status");
    }

    /// Point the connection at a new address. Deliverable in any state; an
    /// established connection is torn down and re-created.
    pub fn set_address(&self, address: IpAddr) {
        if self.tx.try_send(Command::Retarget(address)).is_err() {
            debug!(device = %self.device_id, "connection task gone, address update dropped");
        }
    }

    /// Tear the connection down permanently. Idempotent and callable from
    /// any thread; cancels a pending reconnect before closing the transport.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    fn submit(&self, command: Command, op: &str) {
        if self.state() != ConnectionState::Established {
            warn!(device = %self.device_id, op, "no transport established, dropping command");
            return;
        }
        if self.tx.try_send(command).is_err() {
            warn!(device = %self.device_id, op, "command channel full, dropping command");
        }
    }
}

/// Marker for why a session (one transport lifetime) ended.
enum SessionEnd {
    Failed(DisconnectReason, String),
    Retarget(IpAddr),
    Disposed,
}

struct ConnectionTask {
    config: DeviceConfig,
    address: Option<IpAddr>,
    keys: Arc<KeyStore>,
    listener: Arc<dyn DeviceListener>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self) {
        debug!(device = %self.config.device_id, "connection task started");
        loop {
            self.set_state(ConnectionState::Disconnected);

            let Some(ip) = self.address else {
                if !self.wait_for_address().await {
                    break;
                }
                continue;
            };

            self.set_state(ConnectionState::Connecting);
            let end = self.session(ip).await;
            // The next attempt starts from the long-term key and a new nonce.
            self.keys.reset();
            self.set_state(ConnectionState::Disconnected);

            match end {
                SessionEnd::Disposed => {
                    self.listener
                        .on_disconnected(DisconnectReason::Disposed, "disposed");
                    break;
                }
                SessionEnd::Retarget(new_ip) => {
                    info!(device = %self.config.device_id, %new_ip, "device address changed");
                    self.listener
                        .on_disconnected(DisconnectReason::AddressChanged, "address changed");
                    self.address = Some(new_ip);
                }
                SessionEnd::Failed(reason, message) => {
                    warn!(device = %self.config.device_id, %reason, message = %message, "connection lost");
                    self.listener.on_disconnected(reason, &message);
                    if !self.reconnect_delay().await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!(device = %self.config.device_id, "connection task exited");
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// No target address yet: park until discovery reports one.
    /// Returns false when the task should exit.
    async fn wait_for_address(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            cmd = self.rx.recv() => match cmd {
                Some(Command::Retarget(ip)) => {
                    self.address = Some(ip);
                    true
                }
                Some(_) => {
                    warn!(device = %self.config.device_id, "no address yet, dropping command");
                    true
                }
                None => false,
            },
        }
    }

    /// Fixed-delay reconnect window. Exactly one reconnect is pending here;
    /// disposal cancels it. Returns false when the task should exit.
    async fn reconnect_delay(&mut self) -> bool {
        let deadline = Instant::now() + RECONNECT_DELAY;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Retarget(ip)) => self.address = Some(ip),
                    Some(_) => warn!(
                        device = %self.config.device_id,
                        "not connected, dropping command"
                    ),
                    None => return false,
                },
            }
        }
    }

    /// One transport lifetime: connect, handshake if required, then exchange
    /// messages until something ends the session.
    async fn session(&mut self, ip: IpAddr) -> SessionEnd {
        let addr = SocketAddr::new(ip, self.config.port);
        info!(device = %self.config.device_id, %addr, "connecting");

        let connect = async {
            timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(TuyaError::from)?
                .map_err(TuyaError::from)
        };
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Disposed,
            res = connect => match res {
                Ok(stream) => stream,
                Err(e) => {
                    return SessionEnd::Failed(DisconnectReason::ConnectFailed, e.to_string());
                }
            },
        };

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(4096);
        let mut seq: u32 = 1;

        if self.config.version.requires_handshake() {
            self.set_state(ConnectionState::Handshaking);
            let handshake = handshake_exchange(
                &mut reader,
                &mut writer,
                &mut buf,
                &mut seq,
                &self.encoder,
                &self.decoder,
                self.keys.clone(),
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Disposed,
                res = handshake => if let Err(e) = res {
                    return SessionEnd::Failed(DisconnectReason::HandshakeFailed, e.to_string());
                },
            }
        }

        self.set_state(ConnectionState::Established);
        self.listener.on_connected();
        info!(device = %self.config.device_id, "connection established");

        let mut hb = HeartbeatMonitor::new(Instant::now());

        // First thing on an established link: learn the current state.
        let initial = query_message(self.config.version);
        if let Err(e) = send_message(&mut writer, &self.encoder, &mut seq, &initial).await {
            return SessionEnd::Failed(DisconnectReason::Transport, e.to_string());
        }
        hb.on_write(Instant::now());

        let cancel = self.cancel.clone();
        loop {
            let deadline = hb.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Disposed,

                _ = tokio::time::sleep_until(deadline) => {
                    match hb.poll(Instant::now()) {
                        Some(HeartbeatAction::SendProbe) => {
                            trace!(device = %self.config.device_id, "sending heartbeat probe");
                            if let Err(e) = send_message(
                                &mut writer, &self.encoder, &mut seq, &Message::heartbeat(),
                            ).await {
                                return SessionEnd::Failed(
                                    DisconnectReason::Transport, e.to_string(),
                                );
                            }
                            hb.on_write(Instant::now());
                        }
                        Some(HeartbeatAction::Close(CloseCause::ReadIdle)) => {
                            return SessionEnd::Failed(
                                DisconnectReason::ReadIdle,
                                "no data received within the idle timeout".into(),
                            );
                        }
                        Some(HeartbeatAction::Close(CloseCause::MissedHeartbeats)) => {
                            return SessionEnd::Failed(
                                DisconnectReason::HeartbeatLost,
                                "too many unanswered heartbeats".into(),
                            );
                        }
                        None => {}
                    }
                }

                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        return SessionEnd::Failed(
                            DisconnectReason::Disposed,
                            "all connection handles dropped".into(),
                        );
                    };
                    if let Command::Retarget(new_ip) = cmd {
                        if new_ip != ip {
                            return SessionEnd::Retarget(new_ip);
                        }
                        continue;
                    }
                    let message = outbound_message(self.config.version, cmd);
                    if let Err(e) =
                        send_message(&mut writer, &self.encoder, &mut seq, &message).await
                    {
                        return SessionEnd::Failed(DisconnectReason::Transport, e.to_string());
                    }
                    hb.on_write(Instant::now());
                }

                res = tokio::io::AsyncReadExt::read_buf(&mut reader, &mut buf) => {
                    match res {
                        Err(e) => {
                            return SessionEnd::Failed(DisconnectReason::Transport, e.to_string());
                        }
                        Ok(0) => {
                            return SessionEnd::Failed(
                                DisconnectReason::Transport,
                                "connection closed by peer".into(),
                            );
                        }
                        Ok(_) => {
                            hb.on_read(Instant::now());
                            let end = drain_frames(
                                &self.decoder,
                                &self.listener,
                                &self.config.device_id,
                                &mut buf,
                                &mut hb,
                            );
                            if let Some(end) = end {
                                return end;
                            }
                        }
                    }
                }
            }
        }
    }

}

/// Decode and dispatch every complete frame currently buffered.
fn drain_frames(
    decoder: &FrameDecoder,
    listener: &Arc<dyn DeviceListener>,
    device_id: &str,
    buf: &mut BytesMut,
    hb: &mut HeartbeatMonitor,
) -> Option<SessionEnd> {
    while let Some(frame) = decoder.decode_frame(buf) {
        match decoder.decode_message(&frame) {
            Ok(Message::Raw {
                command: CommandType::HeartBeat,
                ..
            }) => {
                trace!(device = %device_id, "heartbeat answered");
                hb.on_heartbeat_reply(Instant::now());
            }
            Ok(Message::DataPoints {
                command,
                sub_device,
                dps,
            }) => {
                if dps.is_empty() && command != CommandType::Status {
                    trace!(device = %device_id, ?command, "empty acknowledgement");
                } else {
                    listener.on_status(sub_device, dps);
                }
            }
            Ok(other) => {
                debug!(
                    device = %device_id,
                    command = ?other.command(),
                    "unexpected message, dropping"
                );
            }
            // Decryption failures are fatal; anything else is a single
            // undecodable message.
            Err(TuyaError::Crypto(msg)) => {
                return Some(SessionEnd::Failed(DisconnectReason::Decryption, msg));
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "dropping undecodable message");
            }
        }
    }
    None
}

fn query_message(version: Version) -> Message {
    Message::DataPoints {
        command: version.effective_command(CommandType::DpQuery),
        sub_device: None,
        dps: DpMap::new(),
    }
}

fn outbound_message(version: Version, cmd: Command) -> Message {
    match cmd {
        Command::Control(dps) => Message::DataPoints {
            command: version.effective_command(CommandType::Control),
            sub_device: None,
            dps,
        },
        Command::Status => query_message(version),
        Command::Refresh(dp_ids) => Message::Refresh {
            command: CommandType::DpRefresh,
            dp_ids,
        },
        Command::Retarget(_) => unreachable!("retarget handled by the session loop"),
    }
}

async fn send_message(
    writer: &mut OwnedWriteHalf,
    encoder: &FrameEncoder,
    seq: &mut u32,
    message: &Message,
) -> Result<(), TuyaError> {
    let bytes = encoder.encode(message, *seq)?;
    *seq = seq.wrapping_add(1);
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read complete frames off the stream until one decodes, with a per-read
/// timeout.
async fn read_frame(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    decoder: &FrameDecoder,
    limit: std::time::Duration,
) -> Result<crate::frame::Frame, TuyaError> {
    loop {
        if let Some(frame) = decoder.decode_frame(buf) {
            return Ok(frame);
        }
        let n = timeout(limit, tokio::io::AsyncReadExt::read_buf(reader, buf)).await??;
        if n == 0 {
            return Err(TuyaError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during read",
            )));
        }
    }
}

/// Run the v3.4 session-key negotiation on a fresh connection.
async fn handshake_exchange(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    seq: &mut u32,
    encoder: &FrameEncoder,
    decoder: &FrameDecoder,
    keys: Arc<KeyStore>,
) -> Result<(), TuyaError> {
    let mut handshake = SessionHandshake::new(keys);
    send_message(writer, encoder, seq, &handshake.start_message()).await?;

    let finish = loop {
        let frame = read_frame(reader, buf, decoder, HANDSHAKE_TIMEOUT).await?;
        if frame.command != CommandType::SessKeyNegResp {
            debug!(command = ?frame.command, "ignoring message during handshake");
            continue;
        }
        let Message::Raw { payload, .. } = decoder.decode_message(&frame)? else {
            return Err(TuyaError::Handshake("unexpected response shape".into()));
        };
        break handshake.handle_response(&payload)?;
    };

    send_message(writer, encoder, seq, &finish).await?;
    handshake.finalize()
}
