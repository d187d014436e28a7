use bytes::{Bytes, BytesMut};
use tapwire_net::{
    BodyDecoder, BodyFraming, HEAD_TERMINATOR, Limits, ParseError, ParseErrorKind, RequestHead,
    ResponseHead, find_head_end, parse_request_head, parse_response_head,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

const READ_CHUNK: usize = 16 * 1024;

/// HTTP/1.x message reader over a byte stream. Bytes read past the end of a
/// message stay buffered for the next one.
#[derive(Debug)]
pub struct MessageStream<S> {
    io: S,
    buffer: BytesMut,
    limits: Limits,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, limits: Limits) -> Self {
        Self::with_buffered(io, Bytes::new(), limits)
    }

    pub fn with_buffered(io: S, buffered: Bytes, limits: Limits) -> Self {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        buffer.extend_from_slice(&buffered);
        Self { io, buffer, limits }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_parts(self) -> (S, Bytes) {
        (self.io, self.buffer.freeze())
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        self.buffer.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.buffer).await
    }

    /// `Ok(None)` when the peer closed before sending anything.
    async fn read_head(&mut self) -> Result<Option<Bytes>, ProxyError> {
        loop {
            if let Some(end) = find_head_end(&self.buffer, self.limits)? {
                let head = self.buffer.split_to(end + HEAD_TERMINATOR.len());
                return Ok(Some(head.freeze()));
            }
            if self.fill().await? == 0 {
                if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(ParseError {
                    kind: ParseErrorKind::UnexpectedEof,
                    offset: self.buffer.len(),
                }
                .into());
            }
        }
    }

    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ProxyError> {
        // Stray CRLFs between pipelined requests are tolerated.
        while self.buffer.starts_with(b"\r\n") {
            let _ = self.buffer.split_to(2);
        }
        match self.read_head().await? {
            Some(bytes) => Ok(Some(parse_request_head(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn read_response_head(&mut self) -> Result<Option<ResponseHead>, ProxyError> {
        match self.read_head().await? {
            Some(bytes) => Ok(Some(parse_response_head(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Next piece of decoded payload, `None` once the body is complete.
    pub async fn next_body_chunk(
        &mut self,
        decoder: &mut BodyDecoder,
    ) -> Result<Option<Bytes>, ProxyError> {
        let mut out = Vec::new();
        loop {
            if decoder.is_done() {
                return Ok(None);
            }
            if !self.buffer.is_empty() {
                let consumed = decoder.decode(&self.buffer, &mut out)?;
                let _ = self.buffer.split_to(consumed);
                if !out.is_empty() {
                    return Ok(Some(Bytes::from(out)));
                }
                if decoder.is_done() {
                    return Ok(None);
                }
            }
            if self.fill().await? == 0 {
                decoder.finish()?;
                return Ok(None);
            }
        }
    }

    /// Reads and decodes a whole body, refusing more than `max` bytes.
    pub async fn read_body(&mut self, framing: BodyFraming, max: usize) -> Result<Bytes, ProxyError> {
        if let BodyFraming::ContentLength(length) = framing {
            if length > max as u64 {
                return Err(too_large(max));
            }
        }
        let mut decoder = BodyDecoder::new(framing);
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_body_chunk(&mut decoder).await? {
            if body.len() + chunk.len() > max {
                return Err(too_large(max));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.io.write_all(bytes).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.io.flush().await
    }
}

fn too_large(max: usize) -> ProxyError {
    ParseError {
        kind: ParseErrorKind::BodyTooLarge,
        offset: max,
    }
    .into()
}
