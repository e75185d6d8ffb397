//! Buffered connection input and request body decoding.

use bytes::{Bytes, BytesMut};
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 16 * 1024;
/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4096;

/// Read side of a connection with the bytes received but not yet consumed.
pub struct Input<R> {
    io: R,
    pub(crate) buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Input<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read more bytes from the socket. Zero means end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.buf).await
    }

    async fn fill_or_eof(&mut self) -> io::Result<()> {
        if self.fill().await? == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed before request body ended",
            ));
        }
        Ok(())
    }

    /// Up to `max` buffered bytes, reading from the socket if nothing is buffered.
    async fn take(&mut self, max: u64) -> io::Result<Bytes> {
        if self.buf.is_empty() {
            self.fill_or_eof().await?;
        }
        let n = self.buf.len().min(usize::try_from(max).unwrap_or(usize::MAX));
        Ok(self.buf.split_to(n).freeze())
    }

    /// One line without its terminator. Bare `\n` is tolerated.
    async fn line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return Ok(line.freeze());
            }
            if self.buf.len() > MAX_LINE {
                return Err(io::Error::new(ErrorKind::InvalidData, "chunk line too long"));
            }
            self.fill_or_eof().await?;
        }
    }
}

/// How the end of a request body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    Done,
}

/// Pulls body bytes off an `Input` according to the request framing.
#[derive(Debug)]
pub struct BodyDecoder {
    state: State,
}

impl BodyDecoder {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => State::Done,
            Framing::Length(n) => State::Length { remaining: n },
            Framing::Chunked => State::ChunkSize,
        };
        Self { state }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Next piece of body data, `None` once the body has ended.
    pub async fn next_chunk<R: AsyncRead + Unpin>(
        &mut self,
        input: &mut Input<R>,
    ) -> io::Result<Option<Bytes>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Length { remaining } => {
                    let data = input.take(remaining).await?;
                    let remaining = remaining - data.len() as u64;
                    self.state = if remaining == 0 {
                        State::Done
                    } else {
                        State::Length { remaining }
                    };
                    return Ok(Some(data));
                }
                State::ChunkSize => {
                    let line = input.line().await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    let data = input.take(remaining).await?;
                    let remaining = remaining - data.len() as u64;
                    self.state = if remaining == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    return Ok(Some(data));
                }
                State::ChunkEnd => {
                    if !input.line().await?.is_empty() {
                        return Err(io::Error::new(
                            ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    // Trailer fields are read and discarded.
                    if input.line().await?.is_empty() {
                        self.state = State::Done;
                    }
                }
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let invalid = || io::Error::new(ErrorKind::InvalidData, "invalid chunk size");
    let digits = line
        .split(|b| *b == b';')
        .next()
        .map(|d| d.trim_ascii())
        .ok_or_else(invalid)?;
    if digits.is_empty() || digits.len() > 16 {
        return Err(invalid());
    }
    let text = std::str::from_utf8(digits).map_err(|_| invalid())?;
    u64::from_str_radix(text, 16).map_err(|_| invalid())
}
