//! Client for the results query protocol.

use super::server::REQUEST_LEN;
use crate::error::{AppResult, PipelineError};
use crate::volume::VolumeIndex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Longest length header accepted, in digits.
const MAX_HEADER_DIGITS: usize = 10;

/// One persistent connection to a results server.
#[derive(Debug)]
pub struct ResultsClient<S> {
    stream: BufReader<S>,
}

impl ResultsClient<TcpStream> {
    /// Connects to a results server.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl<S> ResultsClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an open stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Asks for the results of volume `index`.
    pub async fn request(&mut self, index: VolumeIndex) -> AppResult<Value> {
        if index > 9999 {
            return Err(PipelineError::IndexOutOfRange(index));
        }
        let request = format!("{index:04}");
        self.request_raw(request.as_bytes()).await
    }

    /// Sends a raw request body and reads one response.
    pub async fn request_raw(&mut self, request: &[u8]) -> AppResult<Value> {
        if request.len() != REQUEST_LEN {
            return Err(PipelineError::Protocol(format!(
                "requests are {REQUEST_LEN} bytes, got {}",
                request.len()
            )));
        }
        let stream = self.stream.get_mut();
        stream.write_all(request).await?;
        stream.flush().await?;

        let mut header = Vec::with_capacity(MAX_HEADER_DIGITS + 1);
        let n = (&mut self.stream)
            .take((MAX_HEADER_DIGITS + 1) as u64)
            .read_until(b'\n', &mut header)
            .await?;
        if n == 0 || header.last() != Some(&b'\n') {
            return Err(PipelineError::Protocol(
                "missing response length header".to_string(),
            ));
        }
        let len: usize = std::str::from_utf8(&header[..n - 1])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PipelineError::Protocol("bad response length header".to_string()))?;

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn request_is_zero_padded_and_response_parsed() {
        let body = br#"{"foundResults":true,"x":1}"#;
        let mut reply = format!("{}\n", body.len()).into_bytes();
        reply.extend_from_slice(body);
        let mock = Builder::new().write(b"0042").read(&reply).build();

        let mut client = ResultsClient::new(mock);
        let value = client.request(42).await.unwrap();
        assert_eq!(value, json!({"foundResults": true, "x": 1}));
    }

    #[tokio::test]
    async fn five_digit_index_is_rejected_locally() {
        let mock = Builder::new().build();
        let mut client = ResultsClient::new(mock);
        assert!(matches!(
            client.request(10_000).await,
            Err(PipelineError::IndexOutOfRange(10_000))
        ));
    }
}
