//! Minimal MQTT 3.1.1 client session.
//!
//! Only what the agent needs: CONNECT with a clean session, QoS 0 PUBLISH,
//! PINGREQ keep-alive and DISCONNECT. Inbound packets other than CONNACK and
//! PINGRESP are read and discarded.
//!
//! Wire format: fixed header byte, remaining length as a 1-4 byte varint,
//! then the packet body. Strings are u16 big-endian length prefixed.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::{ConnError, PubError};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const CLEAN_SESSION: u8 = 0x02;

/// Largest remaining length a 4-byte varint can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Shared network buffer size.
pub const DEFAULT_PACKET_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOptions {
    pub keep_alive: Duration,
    pub connack_timeout: Duration,
    /// Upper bound on any encoded or received packet.
    pub packet_capacity: usize,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(5),
            connack_timeout: Duration::from_secs(1),
            packet_capacity: DEFAULT_PACKET_CAPACITY,
        }
    }
}

/// An encoded packet would exceed the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub needed: usize,
    pub capacity: usize,
}

impl From<Overflow> for ConnError {
    fn from(o: Overflow) -> Self {
        ConnError::BufferTooSmall {
            needed: o.needed,
            capacity: o.capacity,
        }
    }
}

impl From<Overflow> for PubError {
    fn from(o: Overflow) -> Self {
        PubError::BufferTooSmall {
            needed: o.needed,
            capacity: o.capacity,
        }
    }
}

fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Allocate a packet buffer with its fixed header written.
fn start_packet(header: u8, remaining: usize, capacity: usize) -> Result<BytesMut, Overflow> {
    let needed = 1 + remaining_length_size(remaining) + remaining;
    if needed > capacity || remaining > MAX_REMAINING_LENGTH {
        return Err(Overflow { needed, capacity });
    }
    let mut buf = BytesMut::with_capacity(needed);
    buf.put_u8(header);
    put_remaining_length(&mut buf, remaining);
    Ok(buf)
}

fn check_str(s: &str, capacity: usize) -> Result<(), Overflow> {
    if s.len() > u16::MAX as usize {
        return Err(Overflow {
            needed: s.len(),
            capacity: capacity.min(u16::MAX as usize),
        });
    }
    Ok(())
}

pub fn encode_connect(
    client_id: &str,
    keep_alive_secs: u16,
    capacity: usize,
) -> Result<Bytes, Overflow> {
    check_str(client_id, capacity)?;
    let remaining = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + client_id.len();
    let mut buf = start_packet(CONNECT, remaining, capacity)?;
    put_str(&mut buf, PROTOCOL_NAME);
    buf.put_u8(PROTOCOL_LEVEL);
    buf.put_u8(CLEAN_SESSION);
    buf.put_u16(keep_alive_secs);
    put_str(&mut buf, client_id);
    Ok(buf.freeze())
}

/// QoS 0, not retained.
pub fn encode_publish(topic: &str, payload: &[u8], capacity: usize) -> Result<Bytes, Overflow> {
    check_str(topic, capacity)?;
    let remaining = 2 + topic.len() + payload.len();
    let mut buf = start_packet(PUBLISH, remaining, capacity)?;
    put_str(&mut buf, topic);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one packet, returning its header byte and body.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    capacity: usize,
) -> io::Result<(u8, Bytes)> {
    let header = reader.read_u8().await?;

    let mut len = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let byte = reader.read_u8().await?;
        len += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        if i == 3 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed remaining length"));
        }
        multiplier *= 128;
    }

    if len > capacity {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet too large: {len} bytes"),
        ));
    }

    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok((header, body.freeze()))
}

fn keep_alive_secs(keep_alive: Duration) -> u16 {
    u16::try_from(keep_alive.as_secs()).unwrap_or(u16::MAX)
}

/// Send CONNECT over `stream` and wait for CONNACK.
///
/// I/O errors and a missing CONNACK are [`ConnError::TransportDown`]; a
/// refusal is [`ConnError::AuthRejected`].
pub async fn connect<S>(
    mut stream: S,
    client_id: &str,
    opts: &MqttOptions,
) -> Result<Session<S>, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let packet = encode_connect(client_id, keep_alive_secs(opts.keep_alive), opts.packet_capacity)?;

    let io_down = |e: io::Error| ConnError::TransportDown(e.to_string());
    stream.write_all(&packet).await.map_err(io_down)?;
    stream.flush().await.map_err(io_down)?;

    let connack = read_packet(&mut stream, opts.packet_capacity);
    let (header, body) = tokio::time::timeout(opts.connack_timeout, connack)
        .await
        .map_err(|_| ConnError::TransportDown("no CONNACK before timeout".into()))?
        .map_err(io_down)?;

    if header != CONNACK || body.len() != 2 {
        return Err(ConnError::Protocol(format!("expected CONNACK, got 0x{header:02X}")));
    }
    let code = body[1];
    if code != 0 {
        return Err(ConnError::AuthRejected(code));
    }

    tracing::debug!(client_id = %client_id, "MQTT session accepted");
    Ok(Session::start(stream, opts.clone()))
}

/// An accepted session.
///
/// A background task drains inbound packets; when it sees EOF or an error
/// the session is marked closed. Dropping the session stops the task.
pub struct Session<S> {
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    last_sent: Mutex<Instant>,
    ping_sent: Arc<Mutex<Option<Instant>>>,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
    opts: MqttOptions,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn start(stream: S, opts: MqttOptions) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, closed) = watch::channel(false);
        let ping_sent = Arc::new(Mutex::new(None));

        let reader = tokio::spawn(drain(
            read_half,
            Arc::clone(&ping_sent),
            closed_tx,
            opts.packet_capacity,
        ));

        Self {
            writer: tokio::sync::Mutex::new(write_half),
            last_sent: Mutex::new(Instant::now()),
            ping_sent,
            closed,
            reader,
            opts,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await?;
        writer.flush().await?;
        *self.last_sent.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the inbound side has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Time since the last packet was sent.
    pub fn idle(&self) -> Duration {
        self.last_sent.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubError> {
        if self.is_closed() {
            return Err(PubError::TransportDown("session closed".into()));
        }
        let packet = encode_publish(topic, payload, self.opts.packet_capacity)?;
        self.send(&packet)
            .await
            .map_err(|e| PubError::TransportDown(e.to_string()))
    }

    pub async fn ping(&self) -> Result<(), ConnError> {
        self.send(&[PINGREQ, 0x00])
            .await
            .map_err(|e| ConnError::TransportDown(e.to_string()))?;
        self.ping_sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(Instant::now);
        Ok(())
    }

    fn ping_overdue(&self) -> bool {
        self.ping_sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|sent| sent.elapsed() >= self.opts.keep_alive)
    }

    /// Send PINGREQ whenever the session has been idle for the keep-alive
    /// interval. Returns when the broker closes the session or stops
    /// answering pings.
    pub async fn keep_alive(&self) -> ConnError {
        let interval = self.opts.keep_alive;
        loop {
            if self.ping_overdue() {
                return ConnError::TransportDown("PINGRESP not received".into());
            }
            let wait = interval
                .saturating_sub(self.idle())
                .max(Duration::from_millis(10));
            tokio::select! {
                _ = self.closed() => {
                    return ConnError::TransportDown("connection closed by broker".into());
                }
                _ = tokio::time::sleep(wait) => {
                    if self.idle() >= interval {
                        if let Err(e) = self.ping().await {
                            return e;
                        }
                    }
                }
            }
        }
    }

    /// Send DISCONNECT and stop the reader. Errors are ignored.
    pub async fn disconnect(&self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.write_all(&[DISCONNECT, 0x00]).await;
            let _ = writer.shutdown().await;
        }
        self.reader.abort();
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn drain<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    ping_sent: Arc<Mutex<Option<Instant>>>,
    closed: watch::Sender<bool>,
    capacity: usize,
) {
    loop {
        match read_packet(&mut reader, capacity).await {
            Ok((header, _)) if header == PINGRESP => {
                *ping_sent.lock().unwrap_or_else(|e| e.into_inner()) = None;
            }
            Ok((header, body)) => {
                tracing::trace!(header = header, len = body.len(), "Ignoring inbound packet");
            }
            Err(e) => {
                tracing::debug!(error = %e, "MQTT inbound closed");
                break;
            }
        }
    }
    let _ = closed.send(true);
}
