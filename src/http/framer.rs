//! Response body framing and keep-alive decisions.
//!
//! Given a parsed response head this decides how the body is delimited, how
//! many already-buffered bytes belong to it, and whether the connection may
//! be reused afterwards.

use crate::base::neterror::{NetError, ParseSection};
use crate::http::chunked::ChunkedDecoder;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, VIA};
use http::{HeaderMap, Method};

/// What a server is known to support, learned from its status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum HttpBehaviour {
    #[default]
    Unknown = 0,
    Http10 = 1,
    /// HTTP/1.1 server (or proxy) that rejects chunked uploads.
    Http11PartiallyCompliant = 2,
    Http11 = 3,
}

impl HttpBehaviour {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => HttpBehaviour::Http10,
            2 => HttpBehaviour::Http11PartiallyCompliant,
            3 => HttpBehaviour::Http11,
            _ => HttpBehaviour::Unknown,
        }
    }

    /// Fold a new status line version into what was known before.
    /// Only an unknown server is upgraded; a 1.1 server may be downgraded.
    pub fn observe(self, http11: bool) -> Self {
        match self {
            HttpBehaviour::Unknown => {
                if http11 {
                    HttpBehaviour::Http11
                } else {
                    HttpBehaviour::Http10
                }
            }
            HttpBehaviour::Http11 if !http11 => HttpBehaviour::Http10,
            other => other,
        }
    }

    pub fn supports_pipelining(self) -> bool {
        matches!(self, HttpBehaviour::Unknown | HttpBehaviour::Http11)
    }

    pub fn supports_chunked_upload(self) -> bool {
        matches!(self, HttpBehaviour::Unknown | HttpBehaviour::Http11)
    }
}

/// How the body of a response is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body is read, whatever the headers say.
    Empty,
    Length(u64),
    Chunked,
    /// Read until the server closes the connection.
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFraming {
    pub framing: BodyFraming,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub dummy: bool,
}

/// Resolve the framing of a response to `method`.
pub fn resolve(status: u16, headers: &HeaderMap, method: &Method) -> Result<ResponseFraming, NetError> {
    let chunked = is_chunked(headers);
    let content_length = if chunked { None } else { parse_content_length(headers)? };

    let dummy = *method == Method::HEAD
        || (*method == Method::CONNECT && (200..300).contains(&status))
        || status < 200
        || status == 204
        || (status == 304 && content_length.is_none());

    let framing = if dummy {
        BodyFraming::Empty
    } else if chunked {
        BodyFraming::Chunked
    } else if let Some(len) = content_length {
        if len == 0 {
            BodyFraming::Empty
        } else {
            BodyFraming::Length(len)
        }
    } else {
        BodyFraming::UntilClose
    };

    Ok(ResponseFraming { framing, content_length, chunked: chunked && !dummy, dummy })
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
        v.to_str().map(|s| s.to_ascii_lowercase().contains("chunked")).unwrap_or(false)
    })
}

/// Parse `Content-Length`. Duplicates are joined with commas; when the
/// joined value does not parse, the segment after the last comma is tried.
/// A value that still fails is a protocol violation, distinct from absent.
pub fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, NetError> {
    let mut values = headers.get_all(CONTENT_LENGTH).iter().peekable();
    if values.peek().is_none() {
        return Ok(None);
    }

    let mut joined = Vec::new();
    for (i, v) in values.enumerate() {
        if i > 0 {
            joined.push(b',');
        }
        joined.extend_from_slice(v.as_bytes());
    }

    if let Some(len) = parse_digits(&joined) {
        return Ok(Some(len));
    }
    if let Some(comma) = joined.iter().rposition(|&b| b == b',') {
        let tail = trim_ows(&joined[comma + 1..]);
        if let Some(len) = parse_digits(tail) {
            return Ok(Some(len));
        }
    }
    Err(NetError::protocol(ParseSection::ContentLength, "invalid Content-Length"))
}

fn parse_digits(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// How much of the read buffer belongs to the current response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Carve {
    /// The whole body is buffered. `consumed` bytes belong to this
    /// response; anything after them starts the next response.
    Complete { body: Bytes, consumed: usize },
    /// The body continues past the buffer and must be streamed.
    Streaming,
}

/// Split the buffered bytes after a response head.
pub fn carve(framing: BodyFraming, buffered: &[u8]) -> Result<Carve, NetError> {
    match framing {
        BodyFraming::Empty => Ok(Carve::Complete { body: Bytes::new(), consumed: 0 }),
        BodyFraming::Length(len) => {
            if (buffered.len() as u64) >= len {
                let n = len as usize;
                Ok(Carve::Complete { body: Bytes::copy_from_slice(&buffered[..n]), consumed: n })
            } else {
                Ok(Carve::Streaming)
            }
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut body = Vec::new();
            let consumed = decoder.decode(buffered, &mut body)?;
            if decoder.is_done() {
                Ok(Carve::Complete { body: Bytes::from(body), consumed })
            } else {
                Ok(Carve::Streaming)
            }
        }
        BodyFraming::UntilClose => Ok(Carve::Streaming),
    }
}

/// Inputs to the keep-alive verdict for one response.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveInputs<'a> {
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub framing: &'a ResponseFraming,
    /// The transport is TLS protected.
    pub secure: bool,
    pub method: &'a Method,
    /// Declared request body length, if known.
    pub request_length: Option<u64>,
    /// Uploads above this many bytes without an auth module close the connection.
    pub unauthorized_upload_threshold: Option<u64>,
    pub auth_engaged: bool,
    pub behaviour: HttpBehaviour,
    /// Talking to a proxy or through a tunnel, so `Proxy-Connection` counts.
    pub proxy_semantics: bool,
}

/// Whether the connection may be kept alive after this response.
/// Rules are tried in order; the first one that matches decides.
pub fn keep_alive_verdict(inputs: &KeepAliveInputs<'_>) -> bool {
    let framing = inputs.framing;

    if !framing.dummy && framing.content_length.is_none() && !framing.chunked {
        return false;
    }

    if inputs.status == 403 && inputs.secure {
        return false;
    }

    if inputs.status > 299
        && (*inputs.method == Method::POST || *inputs.method == Method::PUT)
        && !inputs.auth_engaged
    {
        if let (Some(threshold), Some(len)) =
            (inputs.unauthorized_upload_threshold, inputs.request_length)
        {
            if len > threshold {
                return false;
            }
        }
    }

    let mut connection = header_tokens(inputs.headers, CONNECTION.as_str());
    if connection.is_none() && inputs.proxy_semantics {
        connection = header_tokens(inputs.headers, "proxy-connection");
    }
    let (have_keep_alive, have_close) = match connection {
        Some(value) => {
            let keep = value.contains("keep-alive");
            (keep, !keep && value.contains("close"))
        }
        None => (false, false),
    };

    let close = (have_close && inputs.behaviour == HttpBehaviour::Http11)
        || (!have_keep_alive && inputs.behaviour <= HttpBehaviour::Http10);
    !close
}

fn header_tokens(headers: &HeaderMap, name: &str) -> Option<String> {
    let mut values = headers.get_all(name).iter().filter_map(|v| v.to_str().ok()).peekable();
    values.peek()?;
    Some(values.collect::<Vec<_>>().join(",").to_ascii_lowercase())
}

/// Reason phrase sent by one known proxy product when it refuses a
/// chunked upload.
const PARTIAL_COMPLIANCE_REASON: &str =
    "Bad Request ( The HTTP request includes a non-supported header. Contact the Server administrator.  )";

/// A `400` from a proxy that cannot handle chunked uploads.
/// Matching it downgrades the server to [`HttpBehaviour::Http11PartiallyCompliant`].
pub fn is_partial_compliance_signature(
    status: u16,
    reason: &str,
    headers: &HeaderMap,
    behaviour: HttpBehaviour,
    chunked_upload: bool,
) -> bool {
    status == 400
        && behaviour == HttpBehaviour::Http11
        && chunked_upload
        && headers.contains_key(VIA)
        && reason.eq_ignore_ascii_case(PARTIAL_COMPLIANCE_REASON)
}
