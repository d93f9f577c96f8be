use thiserror::Error;

/// Region of a response in which a protocol violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseSection {
    /// `HTTP/x.y NNN reason` line.
    StatusLine,
    /// Header block after the status line.
    Headers,
    /// `Content-Length` value.
    ContentLength,
    /// Chunked transfer coding of the body.
    ChunkedBody,
    /// Anything else: bytes with no request to attribute them to.
    Response,
}

impl std::fmt::Display for ParseSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseSection::StatusLine => "status line",
            ParseSection::Headers => "headers",
            ParseSection::ContentLength => "content-length",
            ParseSection::ChunkedBody => "chunked body",
            ParseSection::Response => "response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("Secure channel failure")]
    SecureChannelFailure,
    #[error("Server certificate not trusted")]
    TrustFailure,

    // Connection reuse
    #[error("Keep-alive connection was closed by the server")]
    KeepAliveFailure,
    #[error("Pipelined request failed because the connection was torn down")]
    PipelineFailure,
    #[error("Request canceled")]
    RequestCanceled,
    #[error("Request timed out")]
    TimedOut,
    #[error("Read timed out")]
    ReadTimedOut,
    #[error("Write timed out")]
    WriteTimedOut,

    // Protocol
    #[error("Server protocol violation in {section}: {detail}")]
    ServerProtocolViolation {
        section: ParseSection,
        detail: &'static str,
    },
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Response body too big to drain")]
    ResponseBodyTooBigToDrain,
    #[error("Empty response")]
    EmptyResponse,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Invalid header")]
    InvalidHeader,
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    // Body access
    #[error("Response body already taken")]
    HttpBodyError,
    #[error("Request body producer failed")]
    RequestBodyError,
    #[error("Body is not valid UTF-8")]
    InvalidUtf8,
    #[error("Body is not valid JSON")]
    JsonParseError,

    // Internal
    #[error("Request completed twice in one batch")]
    DuplicateCompletion,
    #[error("Completion sink panicked")]
    CompletionPanicked,
    #[error("Async runtime could not be started")]
    RuntimeUnavailable,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Shorthand for a protocol violation.
    pub fn protocol(section: ParseSection, detail: &'static str) -> Self {
        NetError::ServerProtocolViolation { section, detail }
    }

    /// Timeouts are reported separately from transport failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            NetError::TimedOut
                | NetError::ReadTimedOut
                | NetError::WriteTimedOut
                | NetError::ConnectionTimedOut
        )
    }

    /// Errors raised while establishing the transport.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionRefused
                | NetError::ConnectionFailed
                | NetError::NameNotResolved
                | NetError::ConnectionTimedOut
                | NetError::TunnelConnectionFailed
                | NetError::ProxyConnectionFailed
        )
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::SecureChannelFailure => -107,
            NetError::TunnelConnectionFailed => -111,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::ProxyConnectionFailed => -130,
            NetError::TrustFailure => -202,

            NetError::RequestCanceled => -3,
            NetError::TimedOut => -7,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::InvalidHeader => -319,
            NetError::InvalidChunkedEncoding => -321,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ResponseBodyTooBigToDrain => -345,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::ServerProtocolViolation { .. } => -370,

            // Engine specific codes (-900 and below)
            NetError::KeepAliveFailure => -900,
            NetError::PipelineFailure => -901,
            NetError::ReadTimedOut => -902,
            NetError::WriteTimedOut => -903,
            NetError::HttpStatus(_) => -904,
            NetError::HttpBodyError => -905,
            NetError::RequestBodyError => -906,
            NetError::InvalidUtf8 => -907,
            NetError::JsonParseError => -908,
            NetError::DuplicateCompletion => -909,
            NetError::CompletionPanicked => -910,
            NetError::RuntimeUnavailable => -911,
            NetError::Unknown(code) => *code,
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SecureChannelFailure,
            -111 => NetError::TunnelConnectionFailed,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -130 => NetError::ProxyConnectionFailed,
            -202 => NetError::TrustFailure,
            -3 => NetError::RequestCanceled,
            -7 => NetError::TimedOut,
            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -303 => NetError::InvalidRedirect,
            -310 => NetError::TooManyRedirects,
            -319 => NetError::InvalidHeader,
            -321 => NetError::InvalidChunkedEncoding,
            -324 => NetError::EmptyResponse,
            -325 => NetError::ResponseHeadersTooBig,
            -345 => NetError::ResponseBodyTooBigToDrain,
            -354 => NetError::ContentLengthMismatch,
            -355 => NetError::IncompleteChunkedEncoding,
            -370 => NetError::ServerProtocolViolation {
                section: ParseSection::Response,
                detail: "unspecified",
            },
            -900 => NetError::KeepAliveFailure,
            -901 => NetError::PipelineFailure,
            -902 => NetError::ReadTimedOut,
            -903 => NetError::WriteTimedOut,
            -905 => NetError::HttpBodyError,
            -906 => NetError::RequestBodyError,
            -907 => NetError::InvalidUtf8,
            -908 => NetError::JsonParseError,
            -909 => NetError::DuplicateCompletion,
            -910 => NetError::CompletionPanicked,
            -911 => NetError::RuntimeUnavailable,
            _ => NetError::Unknown(code),
        }
    }
}

/// How a failure may be retried by the submission loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Nothing was sent; safe to retry on another connection.
    Isolated,
    /// Failure attributable to connection reuse; retry once.
    Recoverable,
    /// Surface to the caller.
    RequestFatal,
    /// The service point (proxy) itself is unusable; try the next proxy.
    ServicePointFatal,
}

/// A classified failure delivered through a request's completion sink.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{error} ({class:?})")]
pub struct RequestFailure {
    pub error: NetError,
    pub class: FailureClass,
}

impl RequestFailure {
    pub fn new(error: NetError, class: FailureClass) -> Self {
        Self { error, class }
    }

    pub fn isolated(error: NetError) -> Self {
        Self::new(error, FailureClass::Isolated)
    }

    pub fn recoverable(error: NetError) -> Self {
        Self::new(error, FailureClass::Recoverable)
    }

    pub fn fatal(error: NetError) -> Self {
        Self::new(error, FailureClass::RequestFatal)
    }

    /// Whether the resubmit loop should look at this failure at all.
    /// Recoverable failures get a single retry per request.
    pub fn may_resubmit(&self, once_failed: bool) -> bool {
        match self.class {
            FailureClass::Isolated | FailureClass::ServicePointFatal => true,
            FailureClass::Recoverable => !once_failed,
            FailureClass::RequestFatal => false,
        }
    }

    /// Fatal classes are kept when a later, softer failure arrives.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class,
            FailureClass::RequestFatal | FailureClass::ServicePointFatal
        )
    }
}

impl From<RequestFailure> for NetError {
    fn from(failure: RequestFailure) -> Self {
        failure.error
    }
}
