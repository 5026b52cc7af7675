//! Raw-socket SCPI transport (LXI "SOCKET" resources, typically port 5025).

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::Transport;
use crate::error::{ScpiError, ScpiResult};

/// TCP socket transport.
///
/// The read half is buffered so block payloads and line reads can be mixed
/// without losing bytes between calls.
pub struct TcpTransport {
    resource: String,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to a `TCPIP[n]::host::port::SOCKET` resource.
    pub async fn connect(resource: &str, timeout: Duration) -> ScpiResult<Self> {
        let addr = parse_socket_resource(resource)?;
        debug!(resource, %addr, "opening TCP transport");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ScpiError::ReadTimeout(timeout))??;
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            resource: resource.to_string(),
            reader: Some(BufReader::new(rd)),
            writer: Some(wr),
            timeout,
        })
    }

    fn reader(&mut self) -> ScpiResult<&mut BufReader<OwnedReadHalf>> {
        self.reader
            .as_mut()
            .ok_or_else(|| ScpiError::NotConnected(self.resource.clone()))
    }
}

/// Extract `host:port` from `TCPIP[n]::host::port::SOCKET`.
fn parse_socket_resource(resource: &str) -> ScpiResult<String> {
    let parts: Vec<&str> = resource.split("::").collect();
    match parts.as_slice() {
        [board, host, port, kind]
            if board.to_ascii_uppercase().starts_with("TCPIP")
                && kind.eq_ignore_ascii_case("SOCKET") =>
        {
            Ok(format!("{host}:{port}"))
        }
        _ => Err(ScpiError::UnsupportedResource(resource.to_string())),
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn connected(&self) -> bool {
        self.writer.is_some()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn write_raw(&mut self, data: &[u8]) -> ScpiResult<()> {
        let timeout = self.timeout;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ScpiError::NotConnected(self.resource.clone()))?;
        trace!(bytes = data.len(), "tcp write");
        tokio::time::timeout(timeout, writer.write_all(data))
            .await
            .map_err(|_| ScpiError::ReadTimeout(timeout))??;
        writer.flush().await?;
        Ok(())
    }

    async fn read_until(&mut self, delim: u8) -> ScpiResult<Vec<u8>> {
        let timeout = self.timeout;
        let reader = self.reader()?;
        let mut buf = Vec::new();
        let n = tokio::time::timeout(timeout, reader.read_until(delim, &mut buf))
            .await
            .map_err(|_| ScpiError::ReadTimeout(timeout))??;
        if n == 0 {
            return Err(ScpiError::NotConnected("peer closed connection".into()));
        }
        trace!(bytes = n, "tcp read_until");
        Ok(buf)
    }

    async fn read_exact(&mut self, n: usize) -> ScpiResult<Vec<u8>> {
        let timeout = self.timeout;
        let reader = self.reader()?;
        let mut buf = vec![0u8; n];
        tokio::time::timeout(timeout, reader.read_exact(&mut buf))
            .await
            .map_err(|_| ScpiError::ReadTimeout(timeout))??;
        trace!(bytes = n, "tcp read_exact");
        Ok(buf)
    }

    async fn close(&mut self) -> ScpiResult<()> {
        if let Some(mut wr) = self.writer.take() {
            let _ = wr.shutdown().await;
        }
        self.reader = None;
        debug!(resource = %self.resource, "TCP transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn socket_resource_parsing() {
        assert_eq!(
            parse_socket_resource("TCPIP0::192.168.1.5::5025::SOCKET").unwrap(),
            "192.168.1.5:5025"
        );
        assert!(parse_socket_resource("TCPIP0::host::INSTR").is_err());
        assert!(parse_socket_resource("GPIB0::11::INSTR").is_err());
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let resource = format!("TCPIP0::127.0.0.1::{port}::SOCKET");
        let mut t = TcpTransport::connect(&resource, Duration::from_secs(1))
            .await
            .unwrap();
        t.write_raw(b"*IDN?\n").await.unwrap();
        let line = t.read_until(b'\n').await.unwrap();
        assert_eq!(line, b"*IDN?\n");
        t.close().await.unwrap();
        assert!(!t.connected());
    }

    #[tokio::test]
    async fn read_times_out_when_peer_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let resource = format!("TCPIP0::127.0.0.1::{port}::SOCKET");
        let mut t = TcpTransport::connect(&resource, Duration::from_millis(50))
            .await
            .unwrap();
        let err = t.read_until(b'\n').await.unwrap_err();
        assert!(matches!(err, ScpiError::ReadTimeout(_)));
    }
}
