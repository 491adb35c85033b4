//! Receiving side of the volume transport.
//!
//! [`VolumeReceiver`] listens for the acquisition side; each accepted
//! connection becomes a [`ReceiverSession`] that echoes the greeting, decodes
//! volumes and acknowledges them.

use super::frame::{read_message, read_text, write_text};
use super::protocol::{acknowledgement, VolumeHeader, GREETING_PREFIX};
use crate::error::{AppResult, PipelineError};
use crate::volume::{VolumeIndex, VolumeRecord};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Listening endpoint for volume senders.
#[derive(Debug)]
pub struct VolumeReceiver {
    listener: TcpListener,
}

impl VolumeReceiver {
    /// Binds the listening socket.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Bound address, useful after binding port 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for one sender and completes its handshake.
    pub async fn accept(&self) -> AppResult<ReceiverSession<TcpStream>> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "volume sender connected");
        let mut session = ReceiverSession::new(stream);
        session.handshake().await?;
        Ok(session)
    }
}

/// Server end of one volume session.
#[derive(Debug)]
pub struct ReceiverSession<S> {
    stream: S,
    sender: Option<String>,
    received: u64,
}

impl<S> ReceiverSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an accepted stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sender: None,
            received: 0,
        }
    }

    /// Name the sender gave in its greeting.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Volumes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Reads the greeting and echoes it verbatim.
    pub async fn handshake(&mut self) -> AppResult<()> {
        let hello = read_text(&mut self.stream).await?;
        let Some(name) = hello.strip_prefix(GREETING_PREFIX) else {
            return Err(PipelineError::Protocol(format!(
                "unexpected greeting: {hello:?}"
            )));
        };
        self.sender = Some(name.trim_end().to_string());
        write_text(&mut self.stream, &hello).await?;
        info!(sender = %name.trim_end(), "handshake echoed");
        Ok(())
    }

    /// Next volume, or `None` once the sender closed the connection.
    pub async fn recv_volume(&mut self) -> AppResult<Option<VolumeRecord>> {
        let Some(mut parts) = read_message(&mut self.stream).await? else {
            debug!("sender closed the connection");
            return Ok(None);
        };
        if parts.len() != 2 {
            return Err(PipelineError::Protocol(format!(
                "volume message needs 2 parts, got {}",
                parts.len()
            )));
        }
        let body = parts.pop().unwrap_or_default();
        let header = VolumeHeader::from_json(&parts[0])?;
        let record = header.into_record(body)?;
        self.received += 1;
        debug!(vol_idx = record.index(), "volume received");
        Ok(Some(record))
    }

    /// Acknowledges `index`; `last` tells the sender to stop.
    pub async fn acknowledge(&mut self, index: VolumeIndex, last: bool) -> AppResult<()> {
        write_text(&mut self.stream, &acknowledgement(index, last)).await
    }
}
