//! Serializers for the client side of the protocol.
//!
//! # Purpose
//! Append complete client operations (CONNECT, PING, PONG, PUB, HPUB, SUB,
//! UNSUB) to a shared output buffer. Callers batch several operations into
//! one buffer and flush once.
use bytes::BytesMut;

use crate::headers::HeaderMap;
use crate::info::ConnectInfo;
use crate::{Error, Result};

const CRLF: &[u8] = b"\r\n";

pub fn write_connect(buf: &mut BytesMut, info: &ConnectInfo) -> Result<()> {
    let json = serde_json::to_vec(info).map_err(|err| Error::BadInfo(err.to_string()))?;
    buf.extend_from_slice(b"CONNECT ");
    buf.extend_from_slice(&json);
    buf.extend_from_slice(CRLF);
    Ok(())
}

pub fn write_ping(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PING\r\n");
}

pub fn write_pong(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PONG\r\n");
}

/// `PUB <subject> [reply-to] <#bytes>\r\n<payload>\r\n`
pub fn write_pub(buf: &mut BytesMut, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(reply) = reply_to {
        buf.extend_from_slice(reply.as_bytes());
        buf.extend_from_slice(b" ");
    }
    write_decimal(buf, payload.len() as u64);
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// `HPUB <subject> [reply-to] <#hdr-bytes> <#total-bytes>\r\n<headers><payload>\r\n`
pub fn write_hpub(
    buf: &mut BytesMut,
    subject: &str,
    reply_to: Option<&str>,
    headers: &HeaderMap,
    payload: &[u8],
) {
    let header_len = headers.encoded_len();
    buf.extend_from_slice(b"HPUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(reply) = reply_to {
        buf.extend_from_slice(reply.as_bytes());
        buf.extend_from_slice(b" ");
    }
    write_decimal(buf, header_len as u64);
    buf.extend_from_slice(b" ");
    write_decimal(buf, (header_len + payload.len()) as u64);
    buf.extend_from_slice(CRLF);
    headers.encode(buf);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// `SUB <subject> [queue-group] <sid>\r\n`
pub fn write_sub(buf: &mut BytesMut, subject: &str, queue_group: Option<&str>, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(group) = queue_group {
        buf.extend_from_slice(group.as_bytes());
        buf.extend_from_slice(b" ");
    }
    write_decimal(buf, sid);
    buf.extend_from_slice(CRLF);
}

/// `UNSUB <sid> [max-msgs]\r\n`
pub fn write_unsub(buf: &mut BytesMut, sid: u64, max_msgs: Option<u64>) {
    buf.extend_from_slice(b"UNSUB ");
    write_decimal(buf, sid);
    if let Some(max) = max_msgs {
        buf.extend_from_slice(b" ");
        write_decimal(buf, max);
    }
    buf.extend_from_slice(CRLF);
}

fn write_decimal(buf: &mut BytesMut, value: u64) {
    let mut scratch = itoa::Buffer::new();
    buf.extend_from_slice(scratch.format(value).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(build: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut buf = BytesMut::new();
        build(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn pub_without_reply() {
        let wire = rendered(|buf| write_pub(buf, "greet.joe", None, b"hello"));
        assert_eq!(wire, b"PUB greet.joe 5\r\nhello\r\n");
    }

    #[test]
    fn pub_with_reply() {
        let wire = rendered(|buf| write_pub(buf, "svc", Some("_INBOX.1"), b"q"));
        assert_eq!(wire, b"PUB svc _INBOX.1 1\r\nq\r\n");
    }

    #[test]
    fn hpub_lengths_cover_headers_and_payload() {
        let mut headers = HeaderMap::new();
        headers.insert("A", "b");
        let wire = rendered(|buf| write_hpub(buf, "s", None, &headers, b"xy"));
        // Header block: "NATS/1.0\r\nA: b\r\n\r\n" = 19 bytes; total = 21.
        assert_eq!(wire, b"HPUB s 19 21\r\nNATS/1.0\r\nA: b\r\n\r\nxy\r\n");
    }

    #[test]
    fn sub_with_queue_group() {
        let wire = rendered(|buf| write_sub(buf, "jobs.*", Some("workers"), 42));
        assert_eq!(wire, b"SUB jobs.* workers 42\r\n");
    }

    #[test]
    fn unsub_with_and_without_limit() {
        assert_eq!(rendered(|buf| write_unsub(buf, 7, None)), b"UNSUB 7\r\n");
        assert_eq!(
            rendered(|buf| write_unsub(buf, 7, Some(3))),
            b"UNSUB 7 3\r\n"
        );
    }

    #[test]
    fn connect_is_one_json_line() {
        let mut buf = BytesMut::new();
        write_connect(&mut buf, &ConnectInfo::default()).expect("connect");
        assert!(buf.starts_with(b"CONNECT {"));
        assert!(buf.ends_with(b"}\r\n"));
        // No interior newline: the JSON must stay on the control line.
        assert_eq!(
            buf.iter().filter(|&&byte| byte == b'\n').count(),
            1,
            "CONNECT payload must be a single line"
        );
    }
}
