//! Results query server.
//!
//! Wire format per request on a persistent connection:
//!
//! ```text
//! client → server: 4 ASCII digits, zero-padded volume index
//! server → client: "<len>\n" followed by <len> bytes of JSON
//! ```
//!
//! The JSON is `{"foundResults": true, ...fields}` or `{"foundResults": false}`.
//! A request that is not four digits is answered as not found and the
//! connection stays open.

use super::store::ResultsStore;
use crate::error::AppResult;
use crate::volume::VolumeIndex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Length of one request.
pub const REQUEST_LEN: usize = 4;

/// Parses a request into a volume index. Only ASCII digits are accepted.
pub fn parse_request(request: &[u8; REQUEST_LEN]) -> Option<VolumeIndex> {
    if !request.iter().all(u8::is_ascii_digit) {
        return None;
    }
    request
        .iter()
        .try_fold(0u32, |acc, d| acc.checked_mul(10)?.checked_add(u32::from(d - b'0')))
}

/// Encodes a response as `"<len>\n<json>"`.
pub fn encode_response(body: &serde_json::Value) -> AppResult<Vec<u8>> {
    let json = serde_json::to_vec(body)?;
    let mut out = format!("{}\n", json.len()).into_bytes();
    out.extend_from_slice(&json);
    Ok(out)
}

/// Listening results server, not yet running.
#[derive(Debug)]
pub struct ResultsServer {
    listener: TcpListener,
    store: Arc<ResultsStore>,
}

impl ResultsServer {
    /// Binds the listening socket.
    pub async fn bind<A: ToSocketAddrs>(addr: A, store: Arc<ResultsStore>) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, store })
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts the accept loop on its own task.
    pub fn spawn(self) -> AppResult<ResultsServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("results_server", %addr);
        let task = tokio::spawn(self.run(shutdown_rx).instrument(span));
        Ok(ResultsServerHandle {
            addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("results server listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = Arc::clone(&self.store);
                        let span = info_span!("results_client", %peer);
                        tokio::spawn(handle_client(stream, store).instrument(span));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept results client");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Dropping the listener closes the socket; spawned handlers keep running.
        info!("results server stopped");
    }
}

/// Control handle for a running [`ResultsServer`].
#[derive(Debug)]
pub struct ResultsServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ResultsServerHandle {
    /// Address clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting new clients and closes the listening socket.
    /// Connections already being served are left to finish.
    pub async fn kill(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "results server task ended abnormally");
        }
    }
}

async fn handle_client(mut stream: TcpStream, store: Arc<ResultsStore>) {
    debug!("results client connected");
    let mut request = [0u8; REQUEST_LEN];
    loop {
        match stream.read_exact(&mut request).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!(error = %e, "results client read failed");
                break;
            }
        }

        let body = match parse_request(&request) {
            Some(index) => {
                debug!(vol_idx = index, "results request");
                store.lookup(index)
            }
            None => {
                warn!(request = %String::from_utf8_lossy(&request), "malformed results request");
                ResultsStore::found_response(None)
            }
        };

        let response = match encode_response(&body) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode results response");
                break;
            }
        };
        if let Err(e) = stream.write_all(&response).await {
            warn!(error = %e, "results client write failed");
            break;
        }
    }
    debug!("results client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_must_be_four_digits() {
        assert_eq!(parse_request(b"0001"), Some(1));
        assert_eq!(parse_request(b"9999"), Some(9999));
        assert_eq!(parse_request(b"ab12"), None);
        assert_eq!(parse_request(b" 123"), None);
        assert_eq!(parse_request(b"-001"), None);
    }

    #[test]
    fn response_is_length_prefixed() {
        let bytes = encode_response(&json!({"foundResults": false})).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let (len, body) = text.split_once('\n').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), body.len());
        assert_eq!(body, r#"{"foundResults":false}"#);
    }
}
