//! Minimal HTTP/1.1 framing for the server state machine.
//!
//! Heads are parsed with `httparse` straight out of the connection buffer so
//! the handler can see exactly which bytes belong to the next message.
//! Bodies are `Content-Length` framed or, minimally, chunked.

use bytes::{Buf, BytesMut};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use hyper::{Method, StatusCode, Version};
use thiserror::Error;

/// Header slots offered to the parser.
const MAX_HEADERS: usize = 64;

/// Head-level protocol errors. None of these reach a handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeadError {
    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("invalid content-length")]
    BadContentLength,

    #[error("malformed chunked body")]
    BadChunk,
}

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// How the body that follows a head is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

impl RequestHead {
    /// Try to parse a head from the front of `buf`.
    ///
    /// Returns the head and the number of bytes it occupied, or `None` when
    /// more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        let consumed = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(HeadError::Malformed(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| HeadError::Malformed("missing method".into()))
            .and_then(|m| Method::from_bytes(m.as_bytes()).map_err(|e| HeadError::Malformed(e.to_string())))?;
        let path = req
            .path
            .ok_or_else(|| HeadError::Malformed("missing path".into()))?
            .to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|e| HeadError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(h.value).map_err(|e| HeadError::Malformed(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Some((
            RequestHead {
                method,
                path,
                version,
                headers,
            },
            consumed,
        )))
    }

    pub fn framing(&self) -> Result<BodyFraming, HeadError> {
        if self
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .any(|v| v.to_str().map(|s| s.to_ascii_lowercase().contains("chunked")).unwrap_or(false))
        {
            return Ok(BodyFraming::Chunked);
        }

        let mut lengths = self.headers.get_all(CONTENT_LENGTH).iter();
        let Some(first) = lengths.next() else {
            return Ok(BodyFraming::Empty);
        };
        let length: u64 = first
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(HeadError::BadContentLength)?;
        // Conflicting duplicates are a smuggling vector.
        if lengths.any(|v| v != first) {
            return Err(HeadError::BadContentLength);
        }
        Ok(if length == 0 {
            BodyFraming::Empty
        } else {
            BodyFraming::Length(length)
        })
    }

    fn connection_has(&self, token: &str) -> bool {
        self.headers.get_all(CONNECTION).iter().any(|v| {
            v.to_str()
                .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    }

    /// The peer asked for the connection to end after this exchange.
    pub fn wants_close(&self) -> bool {
        match self.version {
            Version::HTTP_10 => !self.connection_has("keep-alive"),
            _ => self.connection_has("close"),
        }
    }

    /// The request asks to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.connection_has("upgrade") && self.headers.contains_key(UPGRADE)
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Outcome of feeding bytes to a [`ChunkedDecoder`].
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkProgress {
    NeedMore,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
///
/// Extensions are ignored and trailers are skipped.
#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    remaining: u64,
    in_data: bool,
    /// The last chunk was seen; only trailer lines remain.
    in_trailer: bool,
}

impl ChunkedDecoder {
    /// Move decoded data from `src` into `out`, consuming what was used.
    pub fn decode(&mut self, src: &mut BytesMut, out: &mut Vec<u8>) -> Result<ChunkProgress, HeadError> {
        loop {
            if self.in_trailer {
                // Trailer section ends with an empty line.
                loop {
                    let Some(end) = find_crlf(src) else {
                        return Ok(ChunkProgress::NeedMore);
                    };
                    src.advance(end + 2);
                    if end == 0 {
                        self.in_trailer = false;
                        return Ok(ChunkProgress::Done);
                    }
                }
            }

            if self.in_data {
                if self.remaining > 0 {
                    if src.is_empty() {
                        return Ok(ChunkProgress::NeedMore);
                    }
                    let take = (self.remaining as usize).min(src.len());
                    out.extend_from_slice(&src[..take]);
                    src.advance(take);
                    self.remaining -= take as u64;
                    continue;
                }
                // Data is followed by CRLF.
                if src.len() < 2 {
                    return Ok(ChunkProgress::NeedMore);
                }
                if &src[..2] != b"\r\n" {
                    return Err(HeadError::BadChunk);
                }
                src.advance(2);
                self.in_data = false;
                continue;
            }

            let Some(line_end) = find_crlf(src) else {
                return Ok(ChunkProgress::NeedMore);
            };
            let line = std::str::from_utf8(&src[..line_end]).map_err(|_| HeadError::BadChunk)?;
            let size_str = line.split(';').next().unwrap_or_default().trim();
            let size = u64::from_str_radix(size_str, 16).map_err(|_| HeadError::BadChunk)?;
            src.advance(line_end + 2);

            if size == 0 {
                self.in_trailer = true;
                continue;
            }
            self.remaining = size;
            self.in_data = true;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Serialise a complete response.
pub fn encode_response(status: StatusCode, headers: &HeaderMap, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == CONNECTION {
            continue;
        }
        write_header(&mut out, name.as_str(), value.as_bytes());
    }
    if status != StatusCode::SWITCHING_PROTOCOLS {
        write_header(&mut out, "content-length", body.len().to_string().as_bytes());
        let connection: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
        write_header(&mut out, "connection", connection);
    } else {
        write_header(&mut out, "connection", b"Upgrade");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_head_and_reports_consumed_bytes() {
        let raw = b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}";
        let (head, consumed) = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.path, "/echo");
        assert_eq!(&raw[consumed..], b"{}");
        assert_eq!(head.framing().unwrap(), BodyFraming::Length(2));
        assert!(!head.wants_close());
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(RequestHead::parse(b"POST /echo HTTP/1.1\r\nHost").unwrap().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            RequestHead::parse(b"\x01\x02 nonsense\r\n\r\n"),
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.framing(), Err(HeadError::BadContentLength));
    }

    #[test]
    fn http10_closes_unless_keep_alive() {
        let (head, _) = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(head.wants_close());
        let (head, _) = RequestHead::parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.wants_close());
    }

    #[test]
    fn upgrade_needs_connection_token_and_header() {
        let raw = b"GET /ws HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap().unwrap();
        assert!(head.is_upgrade());

        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap().unwrap();
        assert!(!head.is_upgrade());
    }

    #[test]
    fn chunked_body_across_reads() {
        let mut decoder = ChunkedDecoder::default();
        let mut out = Vec::new();

        let mut src = BytesMut::from(&b"4\r\nWi"[..]);
        assert_eq!(decoder.decode(&mut src, &mut out).unwrap(), ChunkProgress::NeedMore);

        src.extend_from_slice(b"ki\r\n5;ext=1\r\npedia\r\n0\r\n\r\nNEXT");
        assert_eq!(decoder.decode(&mut src, &mut out).unwrap(), ChunkProgress::Done);
        assert_eq!(out, b"Wikipedia");
        assert_eq!(&src[..], b"NEXT");
    }

    #[test]
    fn last_chunk_terminator_split_across_reads() {
        let mut decoder = ChunkedDecoder::default();
        let mut out = Vec::new();

        let mut src = BytesMut::from(&b"2\r\nhi\r\n0\r\n"[..]);
        assert_eq!(decoder.decode(&mut src, &mut out).unwrap(), ChunkProgress::NeedMore);

        src.extend_from_slice(b"x-sum: 1");
        assert_eq!(decoder.decode(&mut src, &mut out).unwrap(), ChunkProgress::NeedMore);

        src.extend_from_slice(b"\r\n\r\n");
        assert_eq!(decoder.decode(&mut src, &mut out).unwrap(), ChunkProgress::Done);
        assert_eq!(out, b"hi");
        assert!(src.is_empty());
    }

    #[test]
    fn response_sets_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        let bytes = encode_response(StatusCode::PAYLOAD_TOO_LARGE, &headers, b"", false);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(!text.contains("999"));
    }
}
