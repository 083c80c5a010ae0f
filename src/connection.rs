//! A single TCP stream to the current partition leader.
//!
//! The producer holds at most one connection at a time; it is replaced on
//! forced metadata refreshes, on leader changes, and after any I/O or
//! protocol failure.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Connection {
    addr: String,
    stream: TcpStream,
    read_timeout: Duration,
}

impl Connection {
    /// Connect to `addr` (`host:port`). `send_buffer_hint` is passed to the
    /// socket; `read_timeout` bounds every subsequent read (and the connect
    /// itself).
    pub async fn connect(
        addr: &str,
        send_buffer_hint: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut last_err: Option<std::io::Error> = None;

        for sock_addr in tokio::net::lookup_host(addr).await? {
            match Self::connect_one(sock_addr, send_buffer_hint, read_timeout).await {
                Ok(stream) => {
                    info!(addr, "connected to broker");
                    return Ok(Self {
                        addr: addr.to_owned(),
                        stream,
                        read_timeout,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("'{addr}' did not resolve to any address"),
                )
            })
            .into())
    }

    async fn connect_one(
        sock_addr: SocketAddr,
        send_buffer_hint: usize,
        timeout: Duration,
    ) -> std::io::Result<TcpStream> {
        let socket = match sock_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Err(e) = socket.set_send_buffer_size(send_buffer_hint as u32) {
            debug!(error = %e, "could not apply send buffer hint");
        }

        tokio::time::timeout(timeout, socket.connect(sock_addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Fill `dst` completely, failing on EOF, short data, or the read
    /// deadline.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        tokio::time::timeout(self.read_timeout, self.stream.read_exact(dst))
            .await
            .map_err(|_| {
                Error::SocketIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "response read timed out",
                ))
            })??;
        Ok(())
    }

    /// Discard whatever bytes are immediately available without blocking.
    pub fn drain(&mut self) {
        let mut scratch = [0u8; 512];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => break, // peer closed
                Ok(_) => continue,
                Err(_) => break, // WouldBlock or worse; either way nothing left to discard
            }
        }
    }
}
