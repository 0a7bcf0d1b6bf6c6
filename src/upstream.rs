//! Raw byte streams to the real Docker Engine
use crate::config::EngineEndpoint;
use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Connection to the Engine, over whichever transport it listens on
#[derive(Debug)]
pub enum EngineStream {
  /// TCP
  Tcp(TcpStream),
  #[cfg(unix)]
  /// Unix domain socket
  Unix(UnixStream),
}

impl EngineStream {
  /// Open a fresh connection to `endpoint`.
  ///
  /// The io error is returned as-is, so callers can surface exactly what a
  /// direct connection would have seen.
  pub async fn connect(endpoint: &EngineEndpoint) -> Result<Self, Error> {
    match endpoint {
      EngineEndpoint::Tcp(addr) => {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(EngineStream::Tcp(stream))
      }
      #[cfg(unix)]
      EngineEndpoint::Unix(path) => Ok(EngineStream::Unix(UnixStream::connect(path).await?)),
      #[cfg(not(unix))]
      EngineEndpoint::Unix(_) => Err(Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
      )),
    }
  }
}

impl AsyncRead for EngineStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      EngineStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      #[cfg(unix)]
      EngineStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for EngineStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      EngineStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      #[cfg(unix)]
      EngineStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      EngineStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      #[cfg(unix)]
      EngineStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      EngineStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      #[cfg(unix)]
      EngineStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}
