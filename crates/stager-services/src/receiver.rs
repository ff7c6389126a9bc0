//! Data-plane receiver for the tcp transport backend.
//!
//! Listens on the data port and lands frames pushed by remote stagerd
//! senders. Each connection carries one target file: OPEN names the path,
//! DATA frames are hash-verified and written at their stated offset, CLOSE
//! flushes. Every frame is acknowledged with a single status byte; the
//! sender maps non-OK acks to transport errors and retries.

use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use zerocopy::FromBytes;

use stager_core::wire::{ack, op, FrameHeader};

pub struct DataReceiver {
    listener: TcpListener,
}

impl DataReceiver {
    pub async fn bind(port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the shutdown channel fires. Connections are
    /// handled on their own tasks and end when the peer disconnects or
    /// sends an unparseable frame.
    pub async fn run(self, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            "data receiver listening"
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("data receiver shutting down");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, peer).await {
                                    tracing::debug!(%peer, error = %err, "data connection closed");
                                }
                            });
                        }
                        Err(err) => tracing::warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    tracing::debug!(%peer, "data connection opened");
    let mut open_file: Option<(String, File)> = None;
    let mut header_buf = [0u8; std::mem::size_of::<FrameHeader>()];

    loop {
        match stream.read_exact(&mut header_buf).await {
            Ok(_) => {}
            // Clean end of stream between frames.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let Some(header) = FrameHeader::read_from(&header_buf[..]) else {
            stream.write_all(&[ack::BAD_FRAME]).await?;
            anyhow::bail!("unreadable frame header");
        };
        if let Err(err) = header.validate() {
            // Framing can no longer be trusted; ack and drop the connection.
            tracing::warn!(%peer, error = %err, "invalid frame");
            stream.write_all(&[ack::BAD_FRAME]).await?;
            return Ok(());
        }

        let length = header.length as usize;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;

        if !header.hash_matches(&payload) {
            tracing::warn!(%peer, length, "frame payload hash mismatch");
            stream.write_all(&[ack::BAD_HASH]).await?;
            continue; // framing is intact, the sender retransmits
        }

        let status = match header.op {
            op::OPEN => handle_open(&mut open_file, &payload, peer),
            op::DATA => handle_data(&open_file, header.offset, &payload, peer),
            op::CLOSE => handle_close(&mut open_file, peer),
            // validate() already rejected anything else
            _ => ack::BAD_FRAME,
        };
        stream.write_all(&[status]).await?;
    }
}

fn handle_open(open_file: &mut Option<(String, File)>, payload: &[u8], peer: SocketAddr) -> u8 {
    let Ok(path) = std::str::from_utf8(payload) else {
        tracing::warn!(%peer, "OPEN path is not valid UTF-8");
        return ack::BAD_FRAME;
    };
    if let Some(parent) = Path::new(path).parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::warn!(%peer, path, error = %err, "cannot create target directory");
            return ack::IO_ERROR;
        }
    }
    match OpenOptions::new().create(true).write(true).open(path) {
        Ok(file) => {
            tracing::debug!(%peer, path, "target opened");
            *open_file = Some((path.to_string(), file));
            ack::OK
        }
        Err(err) => {
            tracing::warn!(%peer, path, error = %err, "cannot open target");
            ack::IO_ERROR
        }
    }
}

fn handle_data(
    open_file: &Option<(String, File)>,
    offset: u64,
    payload: &[u8],
    peer: SocketAddr,
) -> u8 {
    let Some((path, file)) = open_file else {
        tracing::warn!(%peer, "DATA frame before OPEN");
        return ack::BAD_FRAME;
    };
    match file.write_all_at(payload, offset) {
        Ok(()) => ack::OK,
        Err(err) => {
            tracing::warn!(%peer, path, offset, error = %err, "write failed");
            ack::IO_ERROR
        }
    }
}

fn handle_close(open_file: &mut Option<(String, File)>, peer: SocketAddr) -> u8 {
    match open_file.take() {
        Some((path, file)) => match file.sync_all() {
            Ok(()) => {
                tracing::debug!(%peer, path, "target closed");
                ack::OK
            }
            Err(err) => {
                tracing::warn!(%peer, path, error = %err, "sync failed");
                ack::IO_ERROR
            }
        },
        None => ack::BAD_FRAME,
    }
}
