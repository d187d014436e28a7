use super::types::{ParseError, ParseErrorKind};

const CRLF: &[u8] = b"\r\n";

/// Terminating chunk of a chunked body, without trailers.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
    Size { line: Vec<u8> },
    Data { remaining: u64 },
    DataCrlf { remaining: u8 },
    Trailer { line: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DecoderState {
    Fixed { remaining: u64 },
    Chunked(ChunkState),
    UntilEof,
    Done,
}

/// Incremental body decoder. Feeds raw wire bytes and emits payload bytes,
/// stopping exactly at the end of the message so that bytes belonging to a
/// pipelined follow-up message are left unconsumed.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    state: DecoderState,
    decoded: u64,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty | BodyFraming::ContentLength(0) => DecoderState::Done,
            BodyFraming::ContentLength(length) => DecoderState::Fixed { remaining: length },
            BodyFraming::Chunked => DecoderState::Chunked(ChunkState::Size { line: Vec::new() }),
            BodyFraming::CloseDelimited => DecoderState::UntilEof,
        };
        Self { state, decoded: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecoderState::Done
    }

    pub fn decoded_len(&self) -> u64 {
        self.decoded
    }

    /// Decodes as much of `input` as belongs to this message, appending payload
    /// to `out`. Returns the number of input bytes consumed.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ParseError> {
        if matches!(self.state, DecoderState::Chunked(_)) {
            return self.decode_chunked(input, out);
        }
        match &mut self.state {
            DecoderState::Done => Ok(0),
            DecoderState::UntilEof => {
                out.extend_from_slice(input);
                self.decoded += input.len() as u64;
                Ok(input.len())
            }
            DecoderState::Fixed { remaining } => {
                let take = (input.len() as u64).min(*remaining) as usize;
                out.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                self.decoded += take as u64;
                if *remaining == 0 {
                    self.state = DecoderState::Done;
                }
                Ok(take)
            }
            DecoderState::Chunked(_) => Ok(0),
        }
    }

    /// Signals end of input. Only close-delimited bodies may end this way.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        match self.state {
            DecoderState::Done => Ok(()),
            DecoderState::UntilEof => {
                self.state = DecoderState::Done;
                Ok(())
            }
            _ => Err(ParseError {
                kind: ParseErrorKind::UnexpectedEof,
                offset: self.decoded as usize,
            }),
        }
    }

    fn decode_chunked(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ParseError> {
        let mut cursor = 0usize;

        while cursor < input.len() {
            let DecoderState::Chunked(chunk_state) = &mut self.state else {
                break;
            };
            match chunk_state {
                ChunkState::Size { line } => {
                    line.push(input[cursor]);
                    cursor += 1;
                    if line.ends_with(CRLF) {
                        let size = parse_chunk_size(&line[..line.len() - CRLF.len()], self.decoded)?;
                        *chunk_state = match size {
                            None => ChunkState::Size { line: Vec::new() },
                            Some(0) => ChunkState::Trailer { line: Vec::new() },
                            Some(size) => ChunkState::Data { remaining: size },
                        };
                    }
                }
                ChunkState::Data { remaining } => {
                    let available = (input.len() - cursor) as u64;
                    let take = available.min(*remaining) as usize;
                    out.extend_from_slice(&input[cursor..cursor + take]);
                    cursor += take;
                    *remaining -= take as u64;
                    self.decoded += take as u64;
                    if *remaining == 0 {
                        *chunk_state = ChunkState::DataCrlf { remaining: 2 };
                    }
                }
                ChunkState::DataCrlf { remaining } => {
                    let expected = if *remaining == 2 { b'\r' } else { b'\n' };
                    if input[cursor] != expected {
                        return Err(ParseError {
                            kind: ParseErrorKind::InvalidChunkTerminator,
                            offset: self.decoded as usize,
                        });
                    }
                    cursor += 1;
                    *remaining -= 1;
                    if *remaining == 0 {
                        *chunk_state = ChunkState::Size { line: Vec::new() };
                    }
                }
                ChunkState::Trailer { line } => {
                    line.push(input[cursor]);
                    cursor += 1;
                    if line.ends_with(CRLF) {
                        if line.len() == CRLF.len() {
                            self.state = DecoderState::Done;
                            break;
                        }
                        line.clear();
                    }
                }
            }
        }

        Ok(cursor)
    }
}

fn parse_chunk_size(line: &[u8], offset: u64) -> Result<Option<u64>, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidChunkSize,
        offset: offset as usize,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Ok(None);
    }
    u64::from_str_radix(size, 16).map(Some).map_err(|_| invalid)
}

/// Frames `data` as a single chunk. Empty input yields nothing, the final
/// chunk is written separately with [`LAST_CHUNK`].
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut framed = Vec::with_capacity(data.len() + 12);
    framed.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    framed.extend_from_slice(data);
    framed.extend_from_slice(CRLF);
    framed
}
