use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Wire protocol version. Any other value in a frame header is a
/// session-fatal protocol violation; there is no negotiation.
pub const PROTOCOL_VERSION: u8 = 1;

/// `version:u8 | type:u8 | stream_id:u32 BE | payload_len:u16 BE`
pub const FRAME_HEADER_LEN: usize = 8;

/// Hard ceiling implied by the u16 length field. The configured
/// `max_payload_bytes` may only lower this.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Stream id 0 carries session-level frames (the initial credit
/// advertisement); it can never be opened as a stream.
pub const SESSION_STREAM_ID: u32 = 0;

/// Protocol violations. All of these are fatal to the session that produced
/// them: once frame boundaries or stream bookkeeping are in doubt there is no
/// safe way to resynchronize the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("payload of {got} bytes exceeds limit of {limit}")]
    PayloadTooLarge { got: usize, limit: usize },
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("frame for unknown stream {0}")]
    UnknownStream(u32),
    #[error("data on closing stream {0}")]
    StreamClosing(u32),
    #[error("stream {0} already open")]
    DuplicateStream(u32),
    #[error("flow control violated on stream {0}")]
    FlowControl(u32),
    #[error("udp streams are disabled")]
    UdpDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0x01,
    Data = 0x02,
    Continue = 0x03,
    Close = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Continue),
            0x04 => Ok(FrameType::Close),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamProtocol {
    Tcp = 0x01,
    Udp = 0x02,
}

impl std::fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamProtocol::Tcp => write!(f, "tcp"),
            StreamProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Reason byte carried by CLOSE frames. The client UI decides what to show
/// (and whether to retry) based solely on this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    Unspecified = 0x01,
    Eof = 0x02,
    NetworkError = 0x03,
    DnsFailure = 0x41,
    DialTimeout = 0x42,
    Refused = 0x43,
    Blocked = 0x47,
    FlowControl = 0x48,
    StreamLimit = 0x49,
}

impl CloseReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x02 => CloseReason::Eof,
            0x03 => CloseReason::NetworkError,
            0x41 => CloseReason::DnsFailure,
            0x42 => CloseReason::DialTimeout,
            0x43 => CloseReason::Refused,
            0x47 => CloseReason::Blocked,
            0x48 => CloseReason::FlowControl,
            0x49 => CloseReason::StreamLimit,
            _ => CloseReason::Unspecified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Parsed OPEN payload: `proto:u8 | port:u16 BE | host utf8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub protocol: StreamProtocol,
    pub host: String,
    pub port: u16,
}

impl Frame {
    pub fn open(stream_id: u32, req: &OpenRequest) -> Self {
        let mut payload = BytesMut::with_capacity(3 + req.host.len());
        payload.put_u8(req.protocol as u8);
        payload.put_u16(req.port);
        payload.extend_from_slice(req.host.as_bytes());
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: payload.freeze(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    pub fn credit(stream_id: u32, additional: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(additional);
        Self {
            frame_type: FrameType::Continue,
            stream_id,
            payload: payload.freeze(),
        }
    }

    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::copy_from_slice(&[reason as u8]),
        }
    }

    pub fn parse_open(&self) -> Result<OpenRequest, ProtocolError> {
        let p = &self.payload;
        if p.len() < 4 {
            return Err(ProtocolError::MalformedPayload("open"));
        }
        let protocol = match p[0] {
            0x01 => StreamProtocol::Tcp,
            0x02 => StreamProtocol::Udp,
            _ => return Err(ProtocolError::MalformedPayload("open")),
        };
        let port = u16::from_be_bytes([p[1], p[2]]);
        let host = std::str::from_utf8(&p[3..])
            .map_err(|_| ProtocolError::MalformedPayload("open"))?
            .trim()
            .to_string();
        if host.is_empty() || port == 0 {
            return Err(ProtocolError::MalformedPayload("open"));
        }
        Ok(OpenRequest {
            protocol,
            host,
            port,
        })
    }

    pub fn parse_credit(&self) -> Result<u32, ProtocolError> {
        let p = &self.payload;
        if p.len() != 4 {
            return Err(ProtocolError::MalformedPayload("continue"));
        }
        Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
    }

    pub fn parse_close(&self) -> Result<CloseReason, ProtocolError> {
        let p = &self.payload;
        if p.len() != 1 {
            return Err(ProtocolError::MalformedPayload("close"));
        }
        Ok(CloseReason::from_u8(p[0]))
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.reserve(FRAME_HEADER_LEN + self.payload.len());
        out.put_u8(PROTOCOL_VERSION);
        out.put_u8(self.frame_type as u8);
        out.put_u32(self.stream_id);
        out.put_u16(self.payload.len() as u16);
        out.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out
    }
}

/// Incremental decoder over the relay connection's byte stream.
///
/// The transport delivers arbitrary chunks; the codec buffers until a full
/// frame is available and never needs look-ahead beyond the fixed header.
#[derive(Debug)]
pub struct FrameCodec {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            max_payload: max_payload.min(MAX_FRAME_PAYLOAD),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` until more bytes arrive.
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let version = self.buf[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let frame_type = FrameType::try_from(self.buf[1])?;
        let stream_id = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
        let payload_len = u16::from_be_bytes([self.buf[6], self.buf[7]]) as usize;
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                got: payload_len,
                limit: self.max_payload,
            });
        }

        if self.buf.len() < FRAME_HEADER_LEN + payload_len {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type,
            stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_handles_partial_chunks() {
        let frame = Frame::data(7, Bytes::from_static(b"hello world"));
        let encoded = frame.encode();

        let mut codec = FrameCodec::new(MAX_FRAME_PAYLOAD);
        for chunk in encoded.chunks(3) {
            codec.extend(chunk);
        }
        // Only the last extend completes the frame; earlier decodes would
        // have returned None. Decode once at the end.
        let got = codec.decode().unwrap().unwrap();
        assert_eq!(got.frame_type, FrameType::Data);
        assert_eq!(got.stream_id, 7);
        assert_eq!(&got.payload[..], b"hello world");
        assert!(codec.decode().unwrap().is_none());
    }

    #[test]
    fn decode_returns_none_until_header_complete() {
        let mut codec = FrameCodec::new(MAX_FRAME_PAYLOAD);
        codec.extend(&[PROTOCOL_VERSION, 0x02, 0, 0]);
        assert!(codec.decode().unwrap().is_none());
    }

    #[test]
    fn decode_two_frames_from_one_chunk() {
        let mut wire = Frame::credit(0, 128).encode();
        wire.extend_from_slice(&Frame::close(3, CloseReason::Eof).encode());

        let mut codec = FrameCodec::new(MAX_FRAME_PAYLOAD);
        codec.extend(&wire);

        let first = codec.decode().unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Continue);
        assert_eq!(first.parse_credit().unwrap(), 128);

        let second = codec.decode().unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Close);
        assert_eq!(second.parse_close().unwrap(), CloseReason::Eof);
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let mut codec = FrameCodec::new(MAX_FRAME_PAYLOAD);
        codec.extend(&[PROTOCOL_VERSION, 0x7f, 0, 0, 0, 1, 0, 0]);
        match codec.decode() {
            Err(ProtocolError::UnknownType(0x7f)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_version_is_protocol_error() {
        let mut codec = FrameCodec::new(MAX_FRAME_PAYLOAD);
        codec.extend(&[9, 0x02, 0, 0, 0, 1, 0, 0]);
        match codec.decode() {
            Err(ProtocolError::BadVersion(9)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_rejected_before_buffering() {
        let mut codec = FrameCodec::new(16);
        // Header claims 17 payload bytes; none are present yet.
        codec.extend(&[PROTOCOL_VERSION, 0x02, 0, 0, 0, 1, 0, 17]);
        match codec.decode() {
            Err(ProtocolError::PayloadTooLarge { got: 17, limit: 16 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn open_payload_roundtrip() {
        let req = OpenRequest {
            protocol: StreamProtocol::Tcp,
            host: "example.com".into(),
            port: 443,
        };
        let frame = Frame::open(11, &req);
        let mut codec = FrameCodec::new(MAX_FRAME_PAYLOAD);
        codec.extend(&frame.encode());
        let got = codec.decode().unwrap().unwrap();
        assert_eq!(got.parse_open().unwrap(), req);
    }

    #[test]
    fn open_payload_rejects_empty_host_and_zero_port() {
        let mut bad_host = BytesMut::new();
        bad_host.put_u8(0x01);
        bad_host.put_u16(80);
        let frame = Frame {
            frame_type: FrameType::Open,
            stream_id: 1,
            payload: bad_host.freeze(),
        };
        assert!(matches!(
            frame.parse_open(),
            Err(ProtocolError::MalformedPayload("open"))
        ));

        let req = OpenRequest {
            protocol: StreamProtocol::Udp,
            host: "example.com".into(),
            port: 0,
        };
        let frame = Frame::open(1, &req);
        assert!(frame.parse_open().is_err());
    }

    #[test]
    fn close_reason_unknown_maps_to_unspecified() {
        assert_eq!(CloseReason::from_u8(0xee), CloseReason::Unspecified);
        assert_eq!(CloseReason::from_u8(0x47), CloseReason::Blocked);
    }
}
