// Streaming parser for the server side of the protocol.
use bytes::{Bytes, BytesMut};

use crate::headers::HeaderMap;
use crate::info::ServerInfo;
use crate::{Error, MAX_CONTROL_LINE, Result};

/// Hard cap for a single message payload unless the caller raises it.
///
/// The MSG/HMSG control line carries an attacker-controlled length; refusing
/// before buffering caps memory growth on a hostile or corrupted stream.
pub const DEFAULT_PAYLOAD_CAP: usize = 16 * 1024 * 1024;

/// One protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

// Control line of a MSG/HMSG whose payload has not fully arrived yet.
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    header_len: usize,
    total_len: usize,
}

/// Incremental parser over the inbound byte stream.
///
/// Feed arbitrary chunks (directly into [`Parser::buffer_mut`] or via
/// [`Parser::push`]) and drain complete events with [`Parser::next`]. The
/// event sequence is identical regardless of how the input was chunked.
/// Payloads are reference-counted slices of the receive buffer; no
/// per-message copy is made.
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    pending: Option<PendingMsg>,
    payload_cap: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::with_payload_cap(DEFAULT_PAYLOAD_CAP)
    }

    pub fn with_payload_cap(payload_cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            pending: None,
            payload_cap,
        }
    }

    /// The receive buffer; socket reads append here without an extra copy.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete event, or `None` until more bytes arrive.
    pub fn next(&mut self) -> Result<Option<ServerOp>> {
        loop {
            if let Some(pending) = self.pending.take() {
                if self.buf.len() < pending.total_len + 2 {
                    self.pending = Some(pending);
                    return Ok(None);
                }
                return self.finish_msg(pending).map(Some);
            }
            let Some(line_end) = find_crlf(&self.buf) else {
                if self.buf.len() > MAX_CONTROL_LINE {
                    return Err(Error::ControlLineTooLong);
                }
                return Ok(None);
            };
            let line = self.buf.split_to(line_end + 2).freeze();
            match self.parse_control_line(&line[..line_end])? {
                Some(op) => return Ok(Some(op)),
                // MSG/HMSG control line consumed; loop to check for the payload.
                None => continue,
            }
        }
    }

    fn parse_control_line(&mut self, line: &[u8]) -> Result<Option<ServerOp>> {
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::BadControlLine("control line is not UTF-8".to_string()))?;
        let (verb, rest) = match text.split_once([' ', '\t']) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (text, ""),
        };
        if verb.eq_ignore_ascii_case("MSG") {
            self.pending = Some(self.parse_msg_args(rest, false)?);
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("HMSG") {
            self.pending = Some(self.parse_msg_args(rest, true)?);
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("INFO") {
            return Ok(Some(ServerOp::Info(ServerInfo::parse(rest.as_bytes())?)));
        }
        if verb.eq_ignore_ascii_case("PING") {
            return Ok(Some(ServerOp::Ping));
        }
        if verb.eq_ignore_ascii_case("PONG") {
            return Ok(Some(ServerOp::Pong));
        }
        if verb.eq_ignore_ascii_case("+OK") {
            return Ok(Some(ServerOp::Ok));
        }
        if verb.eq_ignore_ascii_case("-ERR") {
            return Ok(Some(ServerOp::Err(rest.trim_matches('\'').to_string())));
        }
        Err(Error::UnknownVerb(verb.to_string()))
    }

    // MSG  <subject> <sid> [reply-to] <#bytes>
    // HMSG <subject> <sid> [reply-to] <#hdr-bytes> <#total-bytes>
    fn parse_msg_args(&self, rest: &str, with_headers: bool) -> Result<PendingMsg> {
        let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
        let base = if with_headers { 4 } else { 3 };
        let reply_to = match fields.len() {
            n if n == base => None,
            n if n == base + 1 => Some(fields[2].to_string()),
            _ => {
                return Err(Error::BadControlLine(format!(
                    "wrong argument count in message line: {rest}"
                )));
            }
        };
        let subject = fields[0].to_string();
        let sid: u64 = fields[1]
            .parse()
            .map_err(|_| Error::BadControlLine(format!("invalid sid: {}", fields[1])))?;
        let trailing = if with_headers { 2 } else { 1 };
        let tail = &fields[fields.len() - trailing..];
        let parse_len = |field: &str| -> Result<usize> {
            field
                .parse()
                .map_err(|_| Error::BadControlLine(format!("invalid length: {field}")))
        };
        let (header_len, total_len) = if with_headers {
            (parse_len(tail[0])?, parse_len(tail[1])?)
        } else {
            (0, parse_len(tail[0])?)
        };
        if header_len > total_len {
            return Err(Error::BadControlLine(format!(
                "header length {header_len} exceeds total {total_len}"
            )));
        }
        if total_len > self.payload_cap {
            return Err(Error::PayloadTooLarge {
                length: total_len,
                cap: self.payload_cap,
            });
        }
        Ok(PendingMsg {
            subject,
            sid,
            reply_to,
            header_len,
            total_len,
        })
    }

    fn finish_msg(&mut self, pending: PendingMsg) -> Result<ServerOp> {
        let mut frame = self.buf.split_to(pending.total_len + 2);
        let terminator = frame.split_off(pending.total_len);
        if &terminator[..] != b"\r\n" {
            return Err(Error::BadControlLine(
                "payload not terminated by CRLF".to_string(),
            ));
        }
        let frame = frame.freeze();
        let (headers, payload) = if pending.header_len > 0 {
            let headers = HeaderMap::parse(&frame[..pending.header_len])?;
            (Some(headers), frame.slice(pending.header_len..))
        } else {
            (None, frame)
        };
        Ok(ServerOp::Msg {
            subject: pending.subject,
            sid: pending.sid,
            reply_to: pending.reply_to,
            headers,
            payload,
        })
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
