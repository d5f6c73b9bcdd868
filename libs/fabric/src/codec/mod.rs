//! Length-prefixed frame codec
//!
//! Every frame is a big-endian u32 body length, a one byte frame type, then
//! the body. Decoding buffers partial frames, so the codec can be fed
//! arbitrary splits of the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{Error, Result};

pub mod packet;
mod wire;

pub use self::packet::{
    CallFrame, CorrelationId, Downstream, InterestFrame, LoginFrame, LoginOptions, PostFrame,
    ReplyFrame, ReplyStatus, RequestFrame, SessionStatus, SubscribeFrame, Upstream,
    PROTOCOL_VERSION,
};

use self::packet::{
    BYEBYE, CALL, FLAG_UNIDIRECTIONAL, INTEREST, LOGIN, LOGOUT, MESSAGE, PING, PONG, POST, QUIT,
    REQUEST, SESSION, SUBSCRIBE, UNSUBSCRIBE, WELCOME,
};

/// Largest decoded frame body (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest request payload (32 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

const HEADER_LEN: usize = 5;

/// Codec for Upstream (encoding) and Downstream (decoding)
/// Used by the client side
#[derive(Debug, Clone)]
pub struct ClientCodec {
    max_frame_size: usize,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ClientCodec {
    type Item = Downstream;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Downstream>> {
        match split_frame(src, self.max_frame_size)? {
            Some((kind, body)) => decode_downstream(kind, body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Upstream> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, item: Upstream, dst: &mut BytesMut) -> Result<()> {
        encode_upstream(&item, dst)
    }
}

/// Codec for Downstream (encoding) and Upstream (decoding)
/// Used by the broker side, in tests and tooling
#[derive(Debug, Clone)]
pub struct BrokerCodec {
    max_frame_size: usize,
}

impl BrokerCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for BrokerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BrokerCodec {
    type Item = Upstream;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Upstream>> {
        match split_frame(src, self.max_frame_size)? {
            Some((kind, body)) => decode_upstream(kind, body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Downstream> for BrokerCodec {
    type Error = Error;

    fn encode(&mut self, item: Downstream, dst: &mut BytesMut) -> Result<()> {
        encode_downstream(&item, dst)
    }
}

/// Take one complete frame off the buffer, if there is one
fn split_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<(u8, Bytes)>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > max_frame_size {
        return Err(Error::protocol(format!(
            "frame too large: {} bytes (max {})",
            len, max_frame_size
        )));
    }

    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(4);
    let kind = src.get_u8();
    let body = src.split_to(len).freeze();
    trace!(kind, len, "frame decoded");
    Ok(Some((kind, body)))
}

fn put_header(dst: &mut BytesMut, kind: u8, body_len: usize) -> Result<()> {
    let len = u32::try_from(body_len)
        .map_err(|_| Error::protocol(format!("frame body too long: {} bytes", body_len)))?;
    dst.reserve(HEADER_LEN + body_len);
    dst.put_u32(len);
    dst.put_u8(kind);
    Ok(())
}

fn encode_upstream(item: &Upstream, dst: &mut BytesMut) -> Result<()> {
    match item {
        Upstream::Login(login) => {
            put_header(dst, LOGIN, 1 + wire::string_len(&login.name))?;
            dst.put_u8(login.options.flags());
            wire::put_string(dst, &login.name)
        }
        Upstream::Logout { name } => {
            put_header(dst, LOGOUT, wire::string_len(name))?;
            wire::put_string(dst, name)
        }
        Upstream::Request(frame) => {
            let body_len =
                wire::string_len(&frame.target) + 1 + 4 + 4 + wire::blob_len(&frame.payload);
            put_header(dst, REQUEST, body_len)?;
            wire::put_string(dst, &frame.target)?;
            let flags = if frame.correlation_id.is_none() {
                FLAG_UNIDIRECTIONAL
            } else {
                0
            };
            dst.put_u8(flags);
            dst.put_u32(frame.correlation_id.map_or(0, CorrelationId::get));
            dst.put_u32(frame.timeout_ms);
            wire::put_blob(dst, &frame.payload)
        }
        Upstream::Post(post) => {
            put_header(dst, POST, 4 + wire::blob_len(&post.payload))?;
            dst.put_u32(post.postref);
            wire::put_blob(dst, &post.payload)
        }
        Upstream::Subscribe(subscribe) => {
            let body_len = 4 + wire::string_len(&subscribe.name) + wire::blob_len(&subscribe.topic);
            put_header(dst, SUBSCRIBE, body_len)?;
            dst.put_u32(subscribe.correlation_id.get());
            wire::put_string(dst, &subscribe.name)?;
            wire::put_blob(dst, &subscribe.topic)
        }
        Upstream::Unsubscribe { name, topic } => {
            put_header(dst, UNSUBSCRIBE, wire::string_len(name) + wire::blob_len(topic))?;
            wire::put_string(dst, name)?;
            wire::put_blob(dst, topic)
        }
        Upstream::Pong => put_header(dst, PONG, 0),
        Upstream::Quit => put_header(dst, QUIT, 0),
    }
}

fn decode_upstream(kind: u8, mut body: Bytes) -> Result<Upstream> {
    match kind {
        LOGIN => {
            let flags = wire::get_u8(&mut body, "flags")?;
            let name = wire::get_string(&mut body, "name")?;
            Ok(Upstream::Login(LoginFrame {
                name,
                options: LoginOptions::from_flags(flags),
            }))
        }
        LOGOUT => Ok(Upstream::Logout {
            name: wire::get_string(&mut body, "name")?,
        }),
        REQUEST => {
            let target = wire::get_string(&mut body, "target")?;
            let flags = wire::get_u8(&mut body, "flags")?;
            let raw_id = wire::get_u32(&mut body, "correlation_id")?;
            let timeout_ms = wire::get_u32(&mut body, "timeout_ms")?;
            let payload = wire::get_blob(&mut body, "payload")?;
            let correlation_id = if flags & FLAG_UNIDIRECTIONAL != 0 {
                None
            } else {
                Some(CorrelationId::new(raw_id).ok_or_else(|| {
                    Error::protocol("bidirectional request without a correlation id")
                })?)
            };
            Ok(Upstream::Request(RequestFrame {
                target,
                correlation_id,
                timeout_ms,
                payload,
            }))
        }
        POST => {
            let postref = wire::get_u32(&mut body, "postref")?;
            let payload = wire::get_blob(&mut body, "payload")?;
            Ok(Upstream::Post(PostFrame { postref, payload }))
        }
        SUBSCRIBE => {
            let raw_id = wire::get_u32(&mut body, "correlation_id")?;
            let correlation_id = CorrelationId::new(raw_id)
                .ok_or_else(|| Error::protocol("subscription without a correlation id"))?;
            let name = wire::get_string(&mut body, "name")?;
            let topic = wire::get_blob(&mut body, "topic")?;
            Ok(Upstream::Subscribe(SubscribeFrame {
                correlation_id,
                name,
                topic,
            }))
        }
        UNSUBSCRIBE => {
            let name = wire::get_string(&mut body, "name")?;
            let topic = wire::get_blob(&mut body, "topic")?;
            Ok(Upstream::Unsubscribe { name, topic })
        }
        PONG => Ok(Upstream::Pong),
        QUIT => Ok(Upstream::Quit),
        other => Err(Error::protocol(format!("unknown upstream frame type {:#04x}", other))),
    }
}

fn encode_downstream(item: &Downstream, dst: &mut BytesMut) -> Result<()> {
    match item {
        Downstream::Session { name, status } => {
            put_header(dst, SESSION, 1 + wire::string_len(name))?;
            dst.put_u8(status.as_u8());
            wire::put_string(dst, name)
        }
        Downstream::Call(call) => {
            let body_len = 1 + 4 + wire::string_len(&call.name) + wire::blob_len(&call.payload);
            put_header(dst, CALL, body_len)?;
            dst.put_u8(if call.unidirectional {
                FLAG_UNIDIRECTIONAL
            } else {
                0
            });
            dst.put_u32(call.postref);
            wire::put_string(dst, &call.name)?;
            wire::put_blob(dst, &call.payload)
        }
        Downstream::Reply(reply) => {
            let carries_payload = reply.status == ReplyStatus::Ok;
            let body_len = 1 + 4 + if carries_payload {
                wire::blob_len(&reply.payload)
            } else {
                0
            };
            put_header(dst, MESSAGE, body_len)?;
            dst.put_u8(reply.status.as_u8());
            dst.put_u32(reply.correlation_id);
            if carries_payload {
                wire::put_blob(dst, &reply.payload)?;
            }
            Ok(())
        }
        Downstream::Interest(interest) => {
            let body_len =
                1 + 4 + wire::string_len(&interest.name) + wire::blob_len(&interest.topic);
            put_header(dst, INTEREST, body_len)?;
            dst.put_u8(u8::from(interest.interested));
            dst.put_u32(interest.postref);
            wire::put_string(dst, &interest.name)?;
            wire::put_blob(dst, &interest.topic)
        }
        Downstream::Ping => put_header(dst, PING, 0),
        Downstream::Welcome {
            server_version,
            protocol_version,
        } => {
            put_header(dst, WELCOME, 8)?;
            dst.put_u32(*server_version);
            dst.put_u32(*protocol_version);
            Ok(())
        }
        Downstream::ByeBye => put_header(dst, BYEBYE, 0),
    }
}

fn decode_downstream(kind: u8, mut body: Bytes) -> Result<Downstream> {
    match kind {
        SESSION => {
            let raw_status = wire::get_u8(&mut body, "state")?;
            let status = SessionStatus::from_u8(raw_status)
                .ok_or_else(|| Error::protocol(format!("unknown session state {}", raw_status)))?;
            let name = wire::get_string(&mut body, "name")?;
            Ok(Downstream::Session { name, status })
        }
        CALL => {
            let flags = wire::get_u8(&mut body, "flags")?;
            let postref = wire::get_u32(&mut body, "postref")?;
            let name = wire::get_string(&mut body, "name")?;
            let payload = wire::get_blob(&mut body, "payload")?;
            Ok(Downstream::Call(CallFrame {
                unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
                postref,
                name,
                payload,
            }))
        }
        MESSAGE => {
            let raw_status = wire::get_u8(&mut body, "status")?;
            let status = ReplyStatus::from_u8(raw_status)
                .ok_or_else(|| Error::protocol(format!("unknown reply status {}", raw_status)))?;
            let correlation_id = wire::get_u32(&mut body, "correlation_id")?;
            let payload = if status == ReplyStatus::Ok {
                wire::get_blob(&mut body, "payload")?
            } else {
                Bytes::new()
            };
            Ok(Downstream::Reply(ReplyFrame {
                correlation_id,
                status,
                payload,
            }))
        }
        INTEREST => {
            let interested = match wire::get_u8(&mut body, "status")? {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::protocol(format!("unknown interest status {}", other)))
                }
            };
            let postref = wire::get_u32(&mut body, "postref")?;
            let name = wire::get_string(&mut body, "name")?;
            let topic = wire::get_blob(&mut body, "topic")?;
            Ok(Downstream::Interest(InterestFrame {
                interested,
                postref,
                name,
                topic,
            }))
        }
        PING => Ok(Downstream::Ping),
        WELCOME => {
            let server_version = wire::get_u32(&mut body, "server_version")?;
            let protocol_version = wire::get_u32(&mut body, "protocol_version")?;
            Ok(Downstream::Welcome {
                server_version,
                protocol_version,
            })
        }
        BYEBYE => Ok(Downstream::ByeBye),
        other => Err(Error::protocol(format!(
            "unknown downstream frame type {:#04x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u32, target: &str, payload: &'static [u8]) -> Upstream {
        Upstream::Request(RequestFrame {
            target: target.to_string(),
            correlation_id: CorrelationId::new(id),
            timeout_ms: 5000,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn request_wire_layout() {
        let mut buf = BytesMut::new();
        ClientCodec::new()
            .encode(request(7, "demo_target", b"demo_payload"), &mut buf)
            .unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&(1 + 11 + 1 + 4 + 4 + 4 + 12u32).to_be_bytes());
        expected.push(REQUEST);
        expected.push(11);
        expected.extend_from_slice(b"demo_target");
        expected.push(0);
        expected.extend_from_slice(&7u32.to_be_bytes());
        expected.extend_from_slice(&5000u32.to_be_bytes());
        expected.extend_from_slice(&12u32.to_be_bytes());
        expected.extend_from_slice(b"demo_payload");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn unidirectional_request_has_flag_and_zero_id() {
        let mut buf = BytesMut::new();
        ClientCodec::new()
            .encode(request(0, "log", b"line"), &mut buf)
            .unwrap();

        // header(5) + target(4)
        assert_eq!(buf[9], FLAG_UNIDIRECTIONAL);
        assert_eq!(&buf[10..14], &[0, 0, 0, 0]);

        let decoded = BrokerCodec::new().decode(&mut buf).unwrap().unwrap();
        match decoded {
            Upstream::Request(frame) => assert_eq!(frame.correlation_id, None),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn reply_reaches_client() {
        let mut buf = BytesMut::new();
        let mut broker = BrokerCodec::new();
        broker
            .encode(Downstream::Reply(ReplyFrame::ok(3, "pong")), &mut buf)
            .unwrap();
        broker
            .encode(
                Downstream::Reply(ReplyFrame::failed(4, ReplyStatus::Unreachable)),
                &mut buf,
            )
            .unwrap();

        let mut client = ClientCodec::new();
        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(Downstream::Reply(ReplyFrame::ok(3, "pong")))
        );
        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(Downstream::Reply(ReplyFrame::failed(4, ReplyStatus::Unreachable)))
        );
        assert_eq!(client.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frames_are_buffered() {
        let mut encoded = BytesMut::new();
        let mut broker = BrokerCodec::new();
        broker
            .encode(
                Downstream::Welcome {
                    server_version: 3,
                    protocol_version: PROTOCOL_VERSION,
                },
                &mut encoded,
            )
            .unwrap();
        broker.encode(Downstream::Ping, &mut encoded).unwrap();

        // Feed one byte at a time
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in encoded.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = client.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(
            decoded,
            vec![
                Downstream::Welcome {
                    server_version: 3,
                    protocol_version: 1
                },
                Downstream::Ping
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.put_u8(MESSAGE);

        let result = ClientCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn call_wire_layout() {
        let mut buf = BytesMut::new();
        buf.put_u32(1 + 4 + 5 + 4 + 2);
        buf.put_u8(CALL);
        buf.put_u8(FLAG_UNIDIRECTIONAL);
        buf.put_u32(77);
        buf.put_u8(4);
        buf.put_slice(b"echo");
        buf.put_u32(2);
        buf.put_slice(b"hi");

        let decoded = ClientCodec::new().decode(&mut buf).unwrap();
        assert_eq!(
            decoded,
            Some(Downstream::Call(CallFrame {
                unidirectional: true,
                postref: 77,
                name: "echo".to_string(),
                payload: Bytes::from_static(b"hi"),
            }))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn login_and_subscribe_wire_layout() {
        let mut buf = BytesMut::new();
        let mut client = ClientCodec::new();
        client
            .encode(
                Upstream::Login(LoginFrame {
                    name: "svc".to_string(),
                    options: LoginOptions {
                        persist: true,
                        standby: true,
                        enforce: false,
                    },
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 5, LOGIN, 0b011, 3, b's', b'v', b'c']);

        buf.clear();
        client
            .encode(
                Upstream::Subscribe(SubscribeFrame {
                    correlation_id: CorrelationId::new(9).unwrap(),
                    name: "ab".to_string(),
                    topic: Bytes::from_static(b"t"),
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 12, SUBSCRIBE, 0, 0, 0, 9, 2, b'a', b'b', 0, 0, 0, 1, b't']
        );

        buf.clear();
        client
            .encode(
                Upstream::Post(PostFrame {
                    postref: 5,
                    payload: Bytes::from_static(b"ok"),
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 10, POST, 0, 0, 0, 5, 0, 0, 0, 2, b'o', b'k']);
    }

    #[test]
    fn session_and_interest_reach_client() {
        let frames = vec![
            Downstream::Session {
                name: "svc".to_string(),
                status: SessionStatus::Standby,
            },
            Downstream::Interest(InterestFrame {
                interested: true,
                postref: 12,
                name: "svc".to_string(),
                topic: Bytes::from_static(b"prices"),
            }),
        ];

        let mut buf = BytesMut::new();
        let mut broker = BrokerCodec::new();
        for frame in &frames {
            broker.encode(frame.clone(), &mut buf).unwrap();
        }
        assert_eq!(&buf[..8], &[0, 0, 0, 5, SESSION, 1, 3, b's']);

        let mut client = ClientCodec::new();
        let mut decoded = Vec::new();
        while let Some(frame) = client.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn bad_session_state_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(SESSION);
        buf.put_u8(7);
        buf.put_u8(1);
        buf.put_u8(b'x');

        let result = ClientCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_frame_type_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u8(0x42);

        let result = ClientCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn bad_reply_status_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MESSAGE);
        buf.put_u8(9);
        buf.put_u32(1);

        let result = ClientCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
