use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, RequestHead, RequestLine,
    ResponseHead, StatusLine,
};

const CRLF: &[u8] = b"\r\n";
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Locates the blank line ending a message head. Returns the offset of the
/// terminator, or `None` when more bytes are needed.
pub fn find_head_end(buffer: &[u8], limits: Limits) -> Result<Option<usize>, ParseError> {
    match twoway::find_bytes(buffer, HEAD_TERMINATOR) {
        Some(index) => {
            if index > limits.max_header_bytes {
                return Err(ParseError {
                    kind: ParseErrorKind::HeaderTooLarge,
                    offset: limits.max_header_bytes,
                });
            }
            Ok(Some(index))
        }
        None => {
            if buffer.len() > limits.max_header_bytes {
                return Err(ParseError {
                    kind: ParseErrorKind::HeaderTooLarge,
                    offset: limits.max_header_bytes,
                });
            }
            Ok(None)
        }
    }
}

/// Parses a request line plus header block. A trailing terminator is allowed.
pub fn parse_request_head(bytes: &[u8]) -> Result<RequestHead, ParseError> {
    let bytes = strip_terminator(bytes);
    let line_end = find_line_end(bytes, 0).unwrap_or(bytes.len());
    let line = parse_request_line(&bytes[..line_end], 0)?;
    let headers = parse_headers(tail_after(bytes, line_end), line_end + CRLF.len())?;
    Ok(RequestHead { line, headers })
}

pub fn parse_response_head(bytes: &[u8]) -> Result<ResponseHead, ParseError> {
    let bytes = strip_terminator(bytes);
    let line_end = find_line_end(bytes, 0).unwrap_or(bytes.len());
    let line = parse_status_line(&bytes[..line_end], 0)?;
    let headers = parse_headers(tail_after(bytes, line_end), line_end + CRLF.len())?;
    Ok(ResponseHead { line, headers })
}

fn strip_terminator(mut bytes: &[u8]) -> &[u8] {
    while bytes.ends_with(CRLF) {
        bytes = &bytes[..bytes.len() - CRLF.len()];
    }
    bytes
}

fn tail_after(bytes: &[u8], line_end: usize) -> &[u8] {
    let start = line_end + CRLF.len();
    if start >= bytes.len() {
        &[]
    } else {
        &bytes[start..]
    }
}

fn find_line_end(buffer: &[u8], start: usize) -> Option<usize> {
    twoway::find_bytes(&buffer[start..], CRLF).map(|offset| start + offset)
}

fn parse_request_line(line: &[u8], offset: usize) -> Result<RequestLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.split_whitespace();
    let method = parts.next().ok_or(invalid.clone())?;
    let target = parts.next().ok_or(invalid.clone())?;
    let version_raw = parts.next().unwrap_or("HTTP/1.1");

    if parts.next().is_some() || !method.bytes().all(|byte| byte.is_ascii_alphabetic()) {
        return Err(invalid);
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: parse_http_version(version_raw),
    })
}

fn parse_status_line(line: &[u8], offset: usize) -> Result<StatusLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    let status_raw = parts.next().ok_or(invalid.clone())?;
    let reason = parts.next().unwrap_or("");

    let status_code = status_raw.parse::<u16>().map_err(|_| invalid)?;

    Ok(StatusLine {
        version: parse_http_version(version_raw),
        status_code,
        reason: reason.to_string(),
    })
}

fn parse_http_version(version_raw: &str) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/2" | "HTTP/2.0" => HttpVersion::Http2,
        other => HttpVersion::Other(other.to_string()),
    }
}

fn parse_headers(bytes: &[u8], base_offset: usize) -> Result<Vec<Header>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeaderName,
        offset: base_offset,
    })?;

    let mut headers: Vec<Header> = Vec::new();
    let mut offset = base_offset;

    for line in text.split("\r\n") {
        if line.is_empty() {
            offset += CRLF.len();
            continue;
        }

        // obs-fold: continuation of the previous value
        if line.starts_with([' ', '\t']) {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
                offset += line.len() + CRLF.len();
                continue;
            }
        }

        let Some((raw_name, value)) = line.split_once(':') else {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidHeaderName,
                offset,
            });
        };
        if raw_name.trim().is_empty() || raw_name.ends_with([' ', '\t']) {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidHeaderName,
                offset,
            });
        }

        headers.push(Header {
            name: raw_name.trim().to_string(),
            raw_name: raw_name.to_string(),
            value: value.trim().to_string(),
        });
        offset += line.len() + CRLF.len();
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::{find_head_end, parse_request_head, parse_response_head};
    use crate::http1::{HeaderList, HttpVersion, Limits, ParseErrorKind};

    #[test]
    fn parses_http10_request() {
        let head = parse_request_head(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(head.line.method, "GET");
        assert_eq!(head.line.target, "/");
        assert_eq!(head.line.version, HttpVersion::Http10);
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn parses_absolute_form_target() {
        let head =
            parse_request_head(b"GET http://example.com/path HTTP/1.1\r\nHost: example.com")
                .unwrap();
        assert_eq!(head.line.target, "http://example.com/path");
    }

    #[test]
    fn joins_obs_fold_lines() {
        let head =
            parse_request_head(b"GET / HTTP/1.1\r\nHeader: one\r\n\tcontinued\r\n\r\n").unwrap();
        assert_eq!(head.header("header"), Some("one continued"));
    }

    #[test]
    fn rejects_header_without_colon() {
        let error = parse_request_head(b"GET / HTTP/1.1\r\nbroken header\r\n").unwrap_err();
        assert_eq!(error.kind, ParseErrorKind::InvalidHeaderName);
    }

    #[test]
    fn rejects_garbage_method() {
        let error = parse_request_head(b"\x16\x03\x01 / HTTP/1.1\r\n").unwrap_err();
        assert_eq!(error.kind, ParseErrorKind::InvalidStartLine);
    }

    #[test]
    fn parses_status_line_with_multiword_reason() {
        let head =
            parse_response_head(b"HTTP/1.1 404 Not Found Here\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        assert_eq!(head.line.status_code, 404);
        assert_eq!(head.line.reason, "Not Found Here");
        assert_eq!(head.content_length(), Some(0));
    }

    #[test]
    fn head_end_respects_limit() {
        let limits = Limits {
            max_header_bytes: 10,
            max_body_bytes: 1024,
        };
        let error = find_head_end(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", limits)
            .unwrap_err();
        assert_eq!(error.kind, ParseErrorKind::HeaderTooLarge);
    }

    #[test]
    fn head_end_needs_more() {
        let found = find_head_end(b"GET / HTTP/1.1\r\nHost:", Limits::default()).unwrap();
        assert_eq!(found, None);
    }
}
