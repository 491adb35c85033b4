//! Sending side of the volume transport.
//!
//! A [`VolumeTransport`] owns one connection to the analysis endpoint and walks
//! through `Connected → Ready → Stopped | Failed`. Volumes can only be sent in
//! `Ready`. Any I/O or protocol error moves the session to `Failed`; there is
//! no reconnect.

use super::frame::{read_text, write_message, write_text};
use super::protocol::{greeting, is_stop, VolumeHeader};
use crate::acquisition::StopFlag;
use crate::config::TransportConfig;
use crate::error::{AppResult, PipelineError};
use crate::volume::VolumeRecord;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Socket open, handshake pending
    Connected,
    /// Handshake done, volumes may be sent
    Ready,
    /// Remote endpoint asked to stop
    Stopped,
    /// An error ended the session
    Failed,
}

/// What the remote endpoint said about a delivered volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Keep sending
    Continue,
    /// Last volume; the session is over
    Stop,
}

/// Client end of a volume session.
#[derive(Debug)]
pub struct VolumeTransport<S> {
    stream: S,
    sender_name: String,
    state: TransportState,
    volumes_sent: u64,
}

impl VolumeTransport<TcpStream> {
    /// Connects to the configured endpoint and completes the handshake.
    ///
    /// The TCP connect is retried every `connect_retry` until it succeeds or
    /// `stop` is raised, since the analysis side may come up later.
    pub async fn connect(config: &TransportConfig, stop: &StopFlag) -> AppResult<Self> {
        let address = config.address();
        let mut attempts = 0u32;
        let stream = loop {
            if stop.is_stopped() {
                return Err(PipelineError::Io(std::io::Error::new(
                    ErrorKind::Interrupted,
                    "cancelled while connecting",
                )));
            }
            match TcpStream::connect(&address).await {
                Ok(stream) => break stream,
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 {
                        info!(%address, error = %e, "analysis endpoint not reachable yet, retrying");
                    } else {
                        debug!(%address, attempts, error = %e, "connect retry");
                    }
                    tokio::time::sleep(config.connect_retry).await;
                }
            }
        };
        stream.set_nodelay(true)?;
        info!(%address, "connected to analysis endpoint");

        let mut transport = Self::new(stream, &config.sender_name);
        transport.handshake(config.handshake_timeout).await?;
        Ok(transport)
    }
}

impl<S> VolumeTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an open stream. The handshake has not happened yet.
    pub fn new(stream: S, sender_name: &str) -> Self {
        Self {
            stream,
            sender_name: sender_name.to_string(),
            state: TransportState::Connected,
            volumes_sent: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Volumes acknowledged so far.
    pub fn volumes_sent(&self) -> u64 {
        self.volumes_sent
    }

    /// Sends the greeting and waits until it is echoed back.
    ///
    /// Replies other than the echo are ignored. Without a timeout this waits
    /// as long as the connection stays open.
    pub async fn handshake(&mut self, timeout: Option<Duration>) -> AppResult<()> {
        if self.state != TransportState::Connected {
            return Err(PipelineError::Protocol(format!(
                "handshake attempted in state {:?}",
                self.state
            )));
        }
        let hello = greeting(&self.sender_name);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange_greeting(&hello))
                .await
                .unwrap_or(Err(PipelineError::HandshakeTimeout(limit))),
            None => self.exchange_greeting(&hello).await,
        };
        match result {
            Ok(()) => {
                self.state = TransportState::Ready;
                info!(greeting = %hello.trim_end(), "handshake complete");
                Ok(())
            }
            Err(e) => {
                self.state = TransportState::Failed;
                Err(e)
            }
        }
    }

    async fn exchange_greeting(&mut self, hello: &str) -> AppResult<()> {
        write_text(&mut self.stream, hello).await?;
        loop {
            let reply = read_text(&mut self.stream).await?;
            if reply == hello {
                return Ok(());
            }
            debug!(%reply, "unexpected handshake reply, waiting for echo");
        }
    }

    /// Sends one volume and waits for its acknowledgement.
    pub async fn send_volume(&mut self, record: &VolumeRecord) -> AppResult<SendOutcome> {
        match self.state {
            TransportState::Ready => {}
            TransportState::Stopped => return Err(PipelineError::SessionStopped),
            TransportState::Failed => return Err(PipelineError::SessionFailed),
            TransportState::Connected => {
                return Err(PipelineError::Protocol(
                    "volume sent before handshake".to_string(),
                ))
            }
        }

        match self.deliver(record).await {
            Ok(ack) => {
                self.volumes_sent += 1;
                debug!(vol_idx = record.index(), %ack, "volume acknowledged");
                if is_stop(&ack) {
                    self.state = TransportState::Stopped;
                    info!(vol_idx = record.index(), "remote endpoint requested stop");
                    Ok(SendOutcome::Stop)
                } else {
                    Ok(SendOutcome::Continue)
                }
            }
            Err(e) => {
                self.state = TransportState::Failed;
                warn!(vol_idx = record.index(), error = %e, "volume delivery failed");
                Err(e)
            }
        }
    }

    async fn deliver(&mut self, record: &VolumeRecord) -> AppResult<String> {
        let header = VolumeHeader::from_record(record)?.to_json()?;
        write_message(&mut self.stream, &[&header[..], &record.data()[..]]).await?;
        read_text(&mut self.stream).await
    }
}
