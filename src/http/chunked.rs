//! Chunked transfer coding.
//!
//! [`ChunkedDecoder`] is incremental: it can be fed any slice of the input
//! and reports how many bytes it consumed, stopping right after the final
//! CRLF so that bytes of a pipelined response are left untouched.

use crate::base::neterror::NetError;
use bytes::{BufMut, Bytes, BytesMut};

/// Terminating zero-length chunk with an empty trailer.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame one chunk of request body.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let size = format!("{:X}\r\n", data.len());
    let mut buf = BytesMut::with_capacity(size.len() + data.len() + 2);
    buf.put_slice(size.as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Ext,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Trailer,
    TrailerLf,
    Done,
}

const MAX_SIZE_DIGITS: u8 = 16;

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: State,
    size: u64,
    digits: u8,
    remaining: u64,
    trailer_line: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, size: 0, digits: 0, remaining: 0, trailer_line: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode from `input` into `out`. Returns the number of input bytes consumed.
    pub fn decode<B: BufMut>(&mut self, input: &[u8], out: &mut B) -> Result<usize, NetError> {
        let mut pos = 0;
        while pos < input.len() && self.state != State::Done {
            if self.state == State::Data {
                let available = input.len() - pos;
                let n = (self.remaining.min(available as u64)) as usize;
                out.put_slice(&input[pos..pos + n]);
                pos += n;
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.state = State::DataCr;
                }
                continue;
            }

            let b = input[pos];
            pos += 1;
            self.state = match self.state {
                State::Size => match hex_value(b) {
                    Some(v) => {
                        self.digits += 1;
                        if self.digits > MAX_SIZE_DIGITS {
                            return Err(NetError::InvalidChunkedEncoding);
                        }
                        self.size = (self.size << 4) | u64::from(v);
                        State::Size
                    }
                    None if self.digits == 0 => return Err(NetError::InvalidChunkedEncoding),
                    None => match b {
                        b'\r' => State::SizeLf,
                        b';' | b' ' | b'\t' => State::Ext,
                        _ => return Err(NetError::InvalidChunkedEncoding),
                    },
                },
                State::Ext => match b {
                    b'\r' => State::SizeLf,
                    b'\n' => return Err(NetError::InvalidChunkedEncoding),
                    _ => State::Ext,
                },
                State::SizeLf => {
                    if b != b'\n' {
                        return Err(NetError::InvalidChunkedEncoding);
                    }
                    let size = self.size;
                    self.size = 0;
                    self.digits = 0;
                    if size == 0 {
                        self.trailer_line = 0;
                        State::Trailer
                    } else {
                        self.remaining = size;
                        State::Data
                    }
                }
                State::DataCr => match b {
                    b'\r' => State::DataLf,
                    _ => return Err(NetError::InvalidChunkedEncoding),
                },
                State::DataLf => match b {
                    b'\n' => State::Size,
                    _ => return Err(NetError::InvalidChunkedEncoding),
                },
                State::Trailer => match b {
                    b'\r' => State::TrailerLf,
                    b'\n' => return Err(NetError::InvalidChunkedEncoding),
                    _ => {
                        self.trailer_line += 1;
                        State::Trailer
                    }
                },
                State::TrailerLf => {
                    if b != b'\n' {
                        return Err(NetError::InvalidChunkedEncoding);
                    }
                    if self.trailer_line == 0 {
                        State::Done
                    } else {
                        self.trailer_line = 0;
                        State::Trailer
                    }
                }
                State::Data | State::Done => self.state,
            };
        }
        Ok(pos)
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nX-Trailer: 1\r\n\r\n";

    #[test]
    fn test_decode_one_shot() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let n = decoder.decode(BODY, &mut out).unwrap();
        assert_eq!(n, BODY.len());
        assert!(decoder.is_done());
        assert_eq!(out, b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        for b in BODY {
            assert!(!decoder.is_done());
            assert_eq!(decoder.decode(std::slice::from_ref(b), &mut out).unwrap(), 1);
        }
        assert!(decoder.is_done());
        assert_eq!(out, b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn test_stops_after_last_chunk() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let input = b"1\r\na\r\n0\r\n\r\nHTTP/1.1";
        let n = decoder.decode(input, &mut out).unwrap();
        assert_eq!(&input[n..], b"HTTP/1.1");
    }

    #[test]
    fn test_rejects_garbage() {
        for input in [&b"zz\r\n"[..], b"3\r\nabcX", b"3\nabc", b"\r\n"] {
            let mut decoder = ChunkedDecoder::new();
            let mut out = Vec::new();
            assert_eq!(
                decoder.decode(input, &mut out).unwrap_err(),
                NetError::InvalidChunkedEncoding,
                "{:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_encode_chunk() {
        assert_eq!(&encode_chunk(b"hello world!!!!!")[..], b"10\r\nhello world!!!!!\r\n");
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut wire = encode_chunk(b"abc").to_vec();
        wire.extend_from_slice(LAST_CHUNK);
        decoder.decode(&wire, &mut out).unwrap();
        assert!(decoder.is_done());
        assert_eq!(out, b"abc");
    }
}
