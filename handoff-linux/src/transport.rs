//! Channel adapter over TCP: length-prefixed `ChannelMessage` frames, one reader task and one writer task.
//! TCP gives the ordered, lossless delivery the session needs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use handoff_core::wire::{decode_frame, encode_frame, frame_len, header_len};
use handoff_core::{ChannelMessage, FrameDecodeError, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Inbound side of the channel, in arrival order. `Closed` may be reported more than once.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

/// Outbound side of the channel. Cheap to clone; the writer task stops when every handle is dropped.
#[derive(Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ChannelHandle {
    /// Queue a message for the writer. Fails once the writer is gone.
    pub fn send(&self, msg: &ChannelMessage) -> anyhow::Result<()> {
        let frame = encode_frame(msg)?;
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(frame).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            anyhow::bail!("channel writer closed");
        }
        Ok(())
    }

    /// Bytes queued but not yet written to the socket.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Resolves once the writer has drained below the low watermark.
    pub async fn drained(&self) {
        self.drained.notified().await
    }
}

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "waiting for peer");
    Ok(listener)
}

/// Accept exactly one peer.
pub async fn accept_one(listener: &TcpListener) -> std::io::Result<TcpStream> {
    let (stream, peer) = listener.accept().await?;
    info!(%peer, "peer connected");
    Ok(stream)
}

pub async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    info!(peer = %stream.peer_addr()?, "connected");
    Ok(stream)
}

/// Exchange protocol versions before the first frame. Both sides write first, so neither blocks.
pub async fn handshake(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported protocol version {}", version[0]),
        ));
    }
    Ok(())
}

/// Split the stream into reader and writer tasks. The drained signal fires whenever a write
/// leaves at most `low_watermark` bytes queued.
pub fn spawn_channel(
    stream: TcpStream,
    low_watermark: usize,
) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handle = ChannelHandle {
        tx,
        buffered: Arc::new(AtomicUsize::new(0)),
        drained: Arc::new(Notify::new()),
    };
    tokio::spawn(write_loop(
        writer,
        rx,
        handle.buffered.clone(),
        handle.drained.clone(),
        low_watermark,
        event_tx.clone(),
    ));
    tokio::spawn(read_loop(reader, event_tx));
    (handle, event_rx)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    low_watermark: usize,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(frame) = rx.recv().await {
        let result = writer.write_all(&frame).await;
        let left = buffered
            .fetch_sub(frame.len(), Ordering::SeqCst)
            .saturating_sub(frame.len());
        if let Err(e) = result {
            warn!(error = %e, "channel write failed");
            let _ = events.send(ChannelEvent::Closed);
            return;
        }
        if left <= low_watermark {
            drained.notify_one();
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "channel shutdown");
    }
}

async fn read_loop(mut reader: OwnedReadHalf, events: mpsc::UnboundedSender<ChannelEvent>) {
    loop {
        let mut header = [0u8; header_len()];
        if let Err(e) = reader.read_exact(&mut header).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!(error = %e, "channel read failed");
            }
            break;
        }
        let len = match frame_len(&header) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "bad frame header");
                break;
            }
        };
        let mut frame = vec![0u8; header_len() + len];
        frame[..header_len()].copy_from_slice(&header);
        if let Err(e) = reader.read_exact(&mut frame[header_len()..]).await {
            warn!(error = %e, "channel closed mid-frame");
            break;
        }
        let event = match decode_frame(&frame) {
            Ok((ChannelMessage::Text(t), _)) => ChannelEvent::Text(t),
            Ok((ChannelMessage::Binary(b), _)) => ChannelEvent::Binary(b),
            // The whole frame was consumed, so the stream is still in sync.
            Err(FrameDecodeError::Decode(e)) => {
                warn!(error = %e, len, "discarding undecodable frame");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "bad frame");
                break;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    debug!("channel reader finished");
    let _ = events.send(ChannelEvent::Closed);
}
