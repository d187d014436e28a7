mod body;
mod parser;
mod types;

pub use body::{BodyDecoder, BodyFraming, LAST_CHUNK, encode_chunk};
pub use parser::{HEAD_TERMINATOR, find_head_end, parse_request_head, parse_response_head};
pub use types::{
    Header, HeaderList, HttpVersion, Limits, ParseError, ParseErrorKind, RequestHead,
    RequestLine, ResponseHead, StatusLine, default_reason,
};
