//! Incremental status line parser.
//!
//! Consumes `HTTP/<major>.<minor> <code>[ <reason>]\r\n` one byte at a time so
//! that it can be resumed at any position when the socket delivers a partial
//! read. The status line and the header block draw from one shared
//! [`HeaderBudget`].

/// Byte budget shared by the status line and header block of one response.
#[derive(Debug, Clone, Copy)]
pub struct HeaderBudget {
    used: usize,
    limit: usize,
}

impl HeaderBudget {
    pub fn new(limit: usize) -> Self {
        Self { used: 0, limit }
    }

    /// Claim one byte. Returns false once the limit is reached.
    #[inline]
    pub(crate) fn take(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

/// Result of feeding bytes to one of the response head parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// All input consumed, element not finished.
    NeedMoreData,
    /// Element finished. Bytes past the returned count were not looked at.
    Done,
    /// Malformed input.
    Invalid(&'static str),
    /// The header budget ran out before the element finished.
    DataTooBig,
}

/// A parsed status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub major: u16,
    pub minor: u16,
    pub status: u16,
    pub reason: String,
}

impl StatusLine {
    pub fn version(&self) -> http::Version {
        match (self.major, self.minor) {
            (1, 0) => http::Version::HTTP_10,
            (0, 9) => http::Version::HTTP_09,
            _ => http::Version::HTTP_11,
        }
    }

    /// HTTP/1.1 and later default to persistent connections.
    pub fn is_http11_or_later(&self) -> bool {
        self.major > 1 || (self.major == 1 && self.minor >= 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Prefix(usize),
    Major(u8),
    Minor(u8),
    Code(u8),
    Reason,
    AfterCr,
    Done,
}

const PREFIX: &[u8] = b"HTTP/";
const MAX_VERSION: u16 = 999;

#[derive(Debug)]
pub struct StatusLineParser {
    state: State,
    major: u16,
    minor: u16,
    status: u16,
    reason: Vec<u8>,
}

impl Default for StatusLineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLineParser {
    pub fn new() -> Self {
        Self { state: State::Prefix(0), major: 0, minor: 0, status: 0, reason: Vec::new() }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed `buf`. Returns the status and the number of bytes consumed.
    pub fn parse(&mut self, buf: &[u8], budget: &mut HeaderBudget) -> (ParseStatus, usize) {
        let mut consumed = 0;
        for &b in buf {
            if self.state == State::Done {
                break;
            }
            if !budget.take() {
                return (ParseStatus::DataTooBig, consumed);
            }
            consumed += 1;
            if let Err(detail) = self.step(b) {
                return (ParseStatus::Invalid(detail), consumed);
            }
        }
        let status =
            if self.state == State::Done { ParseStatus::Done } else { ParseStatus::NeedMoreData };
        (status, consumed)
    }

    fn step(&mut self, b: u8) -> Result<(), &'static str> {
        self.state = match self.state {
            State::Prefix(i) => {
                if b != PREFIX[i] {
                    return Err("expected HTTP/ prefix");
                }
                if i + 1 == PREFIX.len() {
                    State::Major(0)
                } else {
                    State::Prefix(i + 1)
                }
            }
            State::Major(n) => match b {
                b'0'..=b'9' => {
                    self.major = push_digit(self.major, b)?;
                    State::Major(n.saturating_add(1))
                }
                b'.' if n > 0 => State::Minor(0),
                _ => return Err("invalid major version"),
            },
            State::Minor(n) => match b {
                b'0'..=b'9' => {
                    self.minor = push_digit(self.minor, b)?;
                    State::Minor(n.saturating_add(1))
                }
                b' ' if n > 0 => State::Code(0),
                _ => return Err("invalid minor version"),
            },
            State::Code(n) => match b {
                b'0'..=b'9' if n < 3 => {
                    self.status = self.status * 10 + u16::from(b - b'0');
                    State::Code(n + 1)
                }
                b' ' if n == 3 => State::Reason,
                b'\r' if n == 3 => State::AfterCr,
                _ => return Err("invalid status code"),
            },
            State::Reason => match b {
                b'\r' => State::AfterCr,
                b if b < 0x20 || b == 0x7f => return Err("control character in reason phrase"),
                b => {
                    self.reason.push(b);
                    State::Reason
                }
            },
            State::AfterCr => match b {
                b'\n' => State::Done,
                _ => return Err("CR not followed by LF"),
            },
            State::Done => State::Done,
        };
        Ok(())
    }

    /// The parsed line, once `parse` has returned `Done`.
    pub fn status_line(&self) -> Option<StatusLine> {
        if self.state != State::Done {
            return None;
        }
        Some(StatusLine {
            major: self.major,
            minor: self.minor,
            status: self.status,
            // ISO-8859-1: every byte maps to the code point of the same value.
            reason: self.reason.iter().map(|&b| b as char).collect(),
        })
    }
}

fn push_digit(value: u16, b: u8) -> Result<u16, &'static str> {
    let next = value * 10 + u16::from(b - b'0');
    if next > MAX_VERSION {
        return Err("version number too large");
    }
    Ok(next)
}
