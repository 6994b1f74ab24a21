// Outbound commands: the units that flow producer → queue → writer.
//
// A command serializes exactly once, into the writer's shared buffer. Async
// variants carry a one-shot completion that the writer fires after the flush
// containing the command's bytes succeeds.
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use tern_wire::{ConnectInfo, HeaderMap, write};

use crate::error::{Error, Result};
use crate::pool::PooledBuf;

pub(crate) type Completion = oneshot::Sender<Result<()>>;

#[derive(Debug)]
pub(crate) struct PublishItem {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: PooledBuf,
}

/// One subscription to re-establish after a reconnect.
#[derive(Debug, Clone)]
pub(crate) struct ReplayEntry {
    pub sid: u64,
    pub subject: String,
    pub queue_group: Option<String>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        info: Box<ConnectInfo>,
        done: Option<Completion>,
    },
    Ping {
        done: Option<Completion>,
    },
    Pong,
    Publish {
        item: PublishItem,
        done: Option<Completion>,
    },
    PublishBatch {
        items: Vec<PublishItem>,
        done: Option<Completion>,
    },
    Subscribe {
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        done: Option<Completion>,
    },
    SubscribeBatch {
        entries: Vec<ReplayEntry>,
        done: Option<Completion>,
    },
    Unsubscribe {
        sid: u64,
        max_msgs: Option<u64>,
        done: Option<Completion>,
    },
    DirectWrite {
        bytes: Bytes,
        repeat: usize,
        done: Option<Completion>,
    },
}

impl Command {
    pub(crate) fn take_done(&mut self) -> Option<Completion> {
        match self {
            Self::Connect { done, .. }
            | Self::Ping { done }
            | Self::Publish { done, .. }
            | Self::PublishBatch { done, .. }
            | Self::Subscribe { done, .. }
            | Self::SubscribeBatch { done, .. }
            | Self::Unsubscribe { done, .. }
            | Self::DirectWrite { done, .. } => done.take(),
            Self::Pong => None,
        }
    }

    /// Append this command's wire form to `buf`.
    ///
    /// Validation happens before the first byte is written, so a failing
    /// command never leaves a partial frame behind.
    pub(crate) fn serialize(&self, buf: &mut BytesMut, max_payload: usize) -> Result<()> {
        match self {
            Self::Connect { info, .. } => write::write_connect(buf, info).map_err(Error::from),
            Self::Ping { .. } => {
                write::write_ping(buf);
                Ok(())
            }
            Self::Pong => {
                write::write_pong(buf);
                Ok(())
            }
            Self::Publish { item, .. } => serialize_publish(buf, item, max_payload),
            Self::PublishBatch { items, .. } => {
                for item in items {
                    check_payload(item.payload.len(), max_payload)?;
                }
                for item in items {
                    serialize_publish(buf, item, max_payload)?;
                }
                Ok(())
            }
            Self::Subscribe {
                sid,
                subject,
                queue_group,
                ..
            } => {
                write::write_sub(buf, subject, queue_group.as_deref(), *sid);
                Ok(())
            }
            Self::SubscribeBatch { entries, .. } => {
                for entry in entries {
                    write::write_sub(buf, &entry.subject, entry.queue_group.as_deref(), entry.sid);
                }
                Ok(())
            }
            Self::Unsubscribe { sid, max_msgs, .. } => {
                write::write_unsub(buf, *sid, *max_msgs);
                Ok(())
            }
            Self::DirectWrite { bytes, repeat, .. } => {
                for _ in 0..*repeat {
                    buf.extend_from_slice(bytes);
                }
                Ok(())
            }
        }
    }
}

fn serialize_publish(buf: &mut BytesMut, item: &PublishItem, max_payload: usize) -> Result<()> {
    check_payload(item.payload.len(), max_payload)?;
    match &item.headers {
        Some(headers) => write::write_hpub(
            buf,
            &item.subject,
            item.reply_to.as_deref(),
            headers,
            &item.payload,
        ),
        None => write::write_pub(buf, &item.subject, item.reply_to.as_deref(), &item.payload),
    }
    Ok(())
}

fn check_payload(length: usize, max_payload: usize) -> Result<()> {
    if length > max_payload {
        return Err(Error::MaxPayloadExceeded(max_payload));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn publish(subject: &str, payload: &[u8]) -> Command {
        Command::Publish {
            item: PublishItem {
                subject: subject.to_string(),
                reply_to: None,
                headers: None,
                payload: PooledBuf::detached(payload),
            },
            done: None,
        }
    }

    #[test]
    fn publish_serializes_to_pub_frame() {
        let mut buf = BytesMut::new();
        publish("a.b", b"hi").serialize(&mut buf, 1024).expect("serialize");
        assert_eq!(&buf[..], b"PUB a.b 2\r\nhi\r\n");
    }

    #[test]
    fn oversized_publish_fails_before_writing() {
        let mut buf = BytesMut::new();
        let err = publish("a", b"too large")
            .serialize(&mut buf, 4)
            .expect_err("cap");
        assert_eq!(err, Error::MaxPayloadExceeded(4));
        assert!(buf.is_empty());
    }

    #[test]
    fn batch_with_one_oversized_item_writes_nothing() {
        let pool = BufferPool::new(4);
        let items = vec![
            PublishItem {
                subject: "a".to_string(),
                reply_to: None,
                headers: None,
                payload: pool.rent(b"ok"),
            },
            PublishItem {
                subject: "b".to_string(),
                reply_to: None,
                headers: None,
                payload: pool.rent(b"oversized"),
            },
        ];
        let mut buf = BytesMut::new();
        let err = Command::PublishBatch { items, done: None }
            .serialize(&mut buf, 4)
            .expect_err("cap");
        assert_eq!(err, Error::MaxPayloadExceeded(4));
        assert!(buf.is_empty());
    }

    #[test]
    fn subscribe_batch_serializes_every_entry() {
        let entries = vec![
            ReplayEntry {
                sid: 1,
                subject: "a".to_string(),
                queue_group: None,
            },
            ReplayEntry {
                sid: 2,
                subject: "b".to_string(),
                queue_group: Some("grp".to_string()),
            },
        ];
        let mut buf = BytesMut::new();
        Command::SubscribeBatch {
            entries,
            done: None,
        }
        .serialize(&mut buf, 1024)
        .expect("serialize");
        assert_eq!(&buf[..], b"SUB a 1\r\nSUB b grp 2\r\n");
    }

    #[test]
    fn direct_write_repeats_bytes() {
        let mut buf = BytesMut::new();
        Command::DirectWrite {
            bytes: Bytes::from_static(b"PING\r\n"),
            repeat: 3,
            done: None,
        }
        .serialize(&mut buf, 1024)
        .expect("serialize");
        assert_eq!(&buf[..], b"PING\r\nPING\r\nPING\r\n");
    }
}
