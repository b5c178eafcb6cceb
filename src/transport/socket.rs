use async_trait::async_trait;
use log::{debug, info};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    config::TimeoutPolicy,
    error::{Error, Result},
};

use super::{Transport, escape};

/// Raw TCP socket, e.g. SCPI on port 5025
pub struct SocketTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}
impl SocketTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
#[async_trait]
impl Transport for SocketTransport {
    async fn open(&mut self, timeouts: &TimeoutPolicy) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let address = self.address();
        let timeout = timeouts.connect();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    target: address,
                    timeout,
                });
            }
            Ok(res) => res.map_err(|e| Error::Connect(format!("{address}: {e}")))?,
        };
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        info!("Connected to {address}");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            /* Peer may already be gone */
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotOpen);
        };

        debug!("socket write: {}", escape(data));

        stream
            .write_all(data)
            .await
            .map_err(|e| Error::Write(e.to_string()))?;

        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotOpen);
        };

        let mut buf = vec![0; max_len];
        let len = stream
            .read(&mut buf)
            .await
            .map_err(|e| Error::Read(e.to_string()))?;
        buf.truncate(len);

        debug!("socket read: {}", escape(&buf));

        Ok(buf)
    }

    fn describe(&self) -> String {
        format!("socket:{}", self.address())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        /* Bind then drop to find a port nobody listens on */
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = SocketTransport::new("127.0.0.1", port);
        let res = transport.open(&TimeoutPolicy::default()).await;
        assert!(matches!(res, Err(Error::Connect(_))), "{res:?}");
    }

    #[tokio::test]
    async fn reads_and_writes_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 7];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"*IDN?\r\n");
            conn.write_all(b"ACME,1\n").await.unwrap();
        });

        let mut transport = SocketTransport::new("127.0.0.1", port);
        let timeouts = TimeoutPolicy::new(Duration::from_secs(2), Duration::ZERO, Duration::ZERO);
        transport.open(&timeouts).await.unwrap();
        assert!(matches!(
            transport.open(&timeouts).await,
            Err(Error::AlreadyOpen)
        ));

        transport.write(b"*IDN?\r\n").await.unwrap();
        let mut got = vec![];
        while !got.ends_with(b"\n") {
            got.extend(transport.read(64).await.unwrap());
        }
        assert_eq!(got, b"ACME,1\n");

        peer.await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
