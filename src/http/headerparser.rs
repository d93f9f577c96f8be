//! Incremental header block parser.
//!
//! Lines must end in CRLF. A line starting with SP or HTAB continues the
//! previous header's value (obsolete line folding) and is joined with a
//! single space. The block ends at the first empty line.

use crate::http::statusline::{HeaderBudget, ParseStatus};
use http::header::{HeaderMap, HeaderName, HeaderValue};

#[derive(Debug, Default)]
pub struct HeaderBlockParser {
    line: Vec<u8>,
    saw_cr: bool,
    pending: Option<(Vec<u8>, Vec<u8>)>,
    headers: HeaderMap,
    done: bool,
}

impl HeaderBlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed `buf`. Returns the status and the number of bytes consumed.
    pub fn parse(&mut self, buf: &[u8], budget: &mut HeaderBudget) -> (ParseStatus, usize) {
        let mut consumed = 0;
        for &b in buf {
            if self.done {
                break;
            }
            if !budget.take() {
                return (ParseStatus::DataTooBig, consumed);
            }
            consumed += 1;

            if self.saw_cr {
                if b != b'\n' {
                    return (ParseStatus::Invalid("CR not followed by LF"), consumed);
                }
                self.saw_cr = false;
                if let Err(detail) = self.end_line() {
                    return (ParseStatus::Invalid(detail), consumed);
                }
                continue;
            }

            match b {
                b'\r' => self.saw_cr = true,
                b'\n' => return (ParseStatus::Invalid("bare LF in header block"), consumed),
                _ => self.line.push(b),
            }
        }
        let status = if self.done { ParseStatus::Done } else { ParseStatus::NeedMoreData };
        (status, consumed)
    }

    fn end_line(&mut self) -> Result<(), &'static str> {
        let line = std::mem::take(&mut self.line);

        if line.is_empty() {
            self.commit()?;
            self.done = true;
            return Ok(());
        }

        if line[0] == b' ' || line[0] == b'\t' {
            let Some((_, value)) = self.pending.as_mut() else {
                return Err("continuation line without a header");
            };
            let folded = trim(&line);
            if !folded.is_empty() {
                if !value.is_empty() {
                    value.push(b' ');
                }
                value.extend_from_slice(folded);
            }
            return Ok(());
        }

        self.commit()?;

        let colon = line.iter().position(|&c| c == b':').ok_or("header line without colon")?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&c| is_token(c)) {
            return Err("invalid header name");
        }
        let value = trim(&line[colon + 1..]);
        if value.iter().any(|&c| (c < 0x20 && c != b'\t') || c == 0x7f) {
            return Err("control character in header value");
        }
        self.pending = Some((name.to_vec(), value.to_vec()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), &'static str> {
        if let Some((name, value)) = self.pending.take() {
            let name = HeaderName::from_bytes(&name).map_err(|_| "invalid header name")?;
            let value = HeaderValue::from_bytes(&value).map_err(|_| "invalid header value")?;
            self.headers.append(name, value);
        }
        Ok(())
    }

    /// Take the parsed headers, leaving the parser empty.
    pub fn take_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.headers)
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&c| c != b' ' && c != b'\t').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&c| c != b' ' && c != b'\t').map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn is_token(c: u8) -> bool {
    matches!(c,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}
