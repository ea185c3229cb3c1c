use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::error::ConnectionError;
use super::protocol::{Command, Dialect};
use crate::constants::{MAX_LINE_LENGTH, READ_TIMEOUT, WRITE_TIMEOUT};

/// Any byte stream a handshake can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Reads and writes terminated command lines over a stream.
pub struct LineTransport<S> {
    stream: S,
    dialect: Dialect,
    read_buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineTransport<S> {
    pub fn new(stream: S, dialect: Dialect) -> Self {
        Self {
            stream,
            dialect,
            read_buf: BytesMut::with_capacity(4 * 1024),
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn send(&mut self, command: &Command) -> Result<(), ConnectionError> {
        let data = command.encode();
        timeout(self.write_timeout, self.stream.write_all(&data))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }

    pub async fn send_all(&mut self, commands: &[Command]) -> Result<(), ConnectionError> {
        for command in commands {
            self.send(command).await?;
        }
        timeout(self.write_timeout, self.stream.flush())
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }

    /// Reads the next non-empty line and decodes it.
    pub async fn receive(&mut self) -> Result<Command, ConnectionError> {
        let separator = self.dialect.separator();
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == separator) {
                let line = self.read_buf.split_to(pos + 1);
                let line = &line[..pos];
                if line.is_empty() {
                    continue;
                }
                return Command::decode(self.dialect, line);
            }

            if self.read_buf.len() > MAX_LINE_LENGTH {
                return Err(ConnectionError::Protocol(format!(
                    "line too long: {}",
                    self.read_buf.len()
                )));
            }

            let n = timeout(self.read_timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| ConnectionError::Timeout)??;

            if n == 0 {
                return Err(ConnectionError::ConnectionClosed);
            }
        }
    }

    /// The stream and any bytes read past the last line.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.read_buf)
    }
}

impl<S: AsyncStream + 'static> LineTransport<S> {
    pub fn boxed(self) -> LineTransport<BoxedStream> {
        LineTransport {
            stream: Box::new(self.stream),
            dialect: self.dialect,
            read_buf: self.read_buf,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}
