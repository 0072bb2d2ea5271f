use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use rmpv::{Integer, Value};

use crate::config;

pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
const BODY_READ_CHUNK_BYTES: usize = 64 * 1024;

/// A decoded frame body: a MessagePack map keyed by UTF-8 strings.
pub type RawEnvelope = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    TruncatedHeader { received: usize },
    TruncatedFrame { declared: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    DuplicateKey { key: String },
    FloatNotAllowed,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
    InvalidMaxFrameSize { value: usize },
    Io(io::Error),
}

impl CodecError {
    /// True when the failure came from the transport rather than from the bytes
    /// the peer sent.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::TruncatedHeader { received } => write!(
                f,
                "stream ended after {received} of {FRAME_HEADER_SIZE_BYTES} header bytes"
            ),
            Self::TruncatedFrame { declared } => {
                write!(f, "stream ended before the declared {declared} frame bytes arrived")
            }
            Self::ProtocolZeroLength => write!(f, "protocol error: frame length cannot be zero"),
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::DuplicateKey { key } => write!(f, "map key '{key}' appears more than once"),
            Self::FloatNotAllowed => write!(f, "floats are not allowed in message envelope"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
            Self::InvalidMaxFrameSize { value } => write!(
                f,
                "max frame size must be between 1 and {} bytes, got {value}",
                u32::MAX
            ),
            Self::Io(source) => write!(f, "transport error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Outcome of reading one frame from a stream.
#[derive(Debug)]
pub enum FrameRead {
    Frame(RawEnvelope),
    /// The peer closed the stream cleanly between frames.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_frame_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: DEFAULT_MAX_FRAME_SIZE_BYTES,
        }
    }
}

impl From<&config::WireConfig> for CodecConfig {
    fn from(value: &config::WireConfig) -> Self {
        Self {
            max_frame_size_bytes: value.max_frame_size_bytes,
        }
    }
}

/// Length-prefixed MessagePack framing: a 4-byte big-endian body length
/// followed by exactly that many bytes holding one map.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_frame_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            max_frame_size_bytes: config.max_frame_size_bytes,
        }
    }

    pub fn try_new(config: CodecConfig) -> Result<Self, CodecError> {
        let value = config.max_frame_size_bytes;
        if value == 0 || value > u32::MAX as usize {
            return Err(CodecError::InvalidMaxFrameSize { value });
        }
        Ok(Self::new(config))
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, CodecError> {
        Self::try_new(CodecConfig::from(&app_config.wire))
    }

    pub fn max_frame_size_bytes(&self) -> usize {
        self.max_frame_size_bytes
    }

    pub fn encode_frame(&self, envelope: &RawEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(envelope)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        let len = payload.len() as u32;
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes one complete frame held in memory.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<RawEnvelope, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len = self.check_declared_len([frame[0], frame[1], frame[2], frame[3]])?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    /// Reads exactly one frame from `reader`, waiting for as many bytes as the
    /// header declares. The declared length is validated before any body byte
    /// is awaited.
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> Result<FrameRead, CodecError> {
        let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE_BYTES {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(FrameRead::Closed),
                Ok(0) => return Err(CodecError::TruncatedHeader { received: filled }),
                Ok(read) => filled += read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(CodecError::Io(error)),
            }
        }

        let declared = self.check_declared_len(header)?;
        // The buffer grows with the bytes that arrive, not with the header's claim.
        let mut payload = Vec::with_capacity(declared.min(BODY_READ_CHUNK_BYTES));
        let received = reader
            .by_ref()
            .take(declared as u64)
            .read_to_end(&mut payload)
            .map_err(CodecError::Io)?;
        if received < declared {
            return Err(CodecError::TruncatedFrame { declared });
        }

        self.decode_payload(&payload).map(FrameRead::Frame)
    }

    pub fn write_frame<W: Write>(
        &self,
        writer: &mut W,
        envelope: &RawEnvelope,
    ) -> Result<(), CodecError> {
        let frame = self.encode_frame(envelope)?;
        writer.write_all(&frame).map_err(CodecError::Io)?;
        writer.flush().map_err(CodecError::Io)
    }

    pub fn encode_payload(&self, envelope: &RawEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut map_pairs = Vec::with_capacity(envelope.len());
        for (key, value) in envelope {
            validate_value(value)?;
            map_pairs.push((Value::String(key.as_str().into()), value.clone()));
        }

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &Value::Map(map_pairs))
            .map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_frame_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_frame_size_bytes,
            });
        }

        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<RawEnvelope, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_frame_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_frame_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value =
            rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_envelope(value)
    }

    fn check_declared_len(&self, header: [u8; FRAME_HEADER_SIZE_BYTES]) -> Result<usize, CodecError> {
        let declared = u32::from_be_bytes(header) as usize;
        if declared == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared > self.max_frame_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared,
                limit: self.max_frame_size_bytes,
            });
        }
        Ok(declared)
    }
}

fn parse_envelope(value: Value) -> Result<RawEnvelope, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::EnvelopeMustBeMap);
    };

    let mut envelope = RawEnvelope::new();
    for (key, value) in entries {
        let key = parse_key(&key)?;
        validate_value(&value)?;
        if envelope.contains_key(&key) {
            return Err(CodecError::DuplicateKey { key });
        }
        envelope.insert(key, value);
    }

    Ok(envelope)
}

fn parse_key(key: &Value) -> Result<String, CodecError> {
    key.as_str()
        .map(str::to_owned)
        .ok_or(CodecError::MapKeyMustBeUtf8String)
}

fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil | Value::Boolean(_) | Value::String(_) | Value::Binary(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => {
            let mut seen = BTreeSet::new();
            for (key, value) in entries {
                let key = key.as_str().ok_or(CodecError::MapKeyMustBeUtf8String)?;
                if !seen.insert(key) {
                    return Err(CodecError::DuplicateKey {
                        key: key.to_owned(),
                    });
                }
                validate_value(value)?;
            }
            Ok(())
        }
        Value::F32(_) | Value::F64(_) => Err(CodecError::FloatNotAllowed),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }

    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};

    use rmpv::Value;

    use super::{
        CodecConfig, CodecError, FrameRead, RawEnvelope, WireCodec, BODY_READ_CHUNK_BYTES,
        DEFAULT_MAX_FRAME_SIZE_BYTES, FRAME_HEADER_SIZE_BYTES,
    };

    /// Hands out at most `chunk` bytes per read call.
    struct ChunkedReader {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let limit = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..limit])
        }
    }

    /// Remembers the largest buffer it was asked to fill.
    struct RecordingReader {
        inner: Cursor<Vec<u8>>,
        largest_request: usize,
    }

    impl Read for RecordingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.largest_request = self.largest_request.max(buf.len());
            self.inner.read(buf)
        }
    }

    fn small_codec() -> WireCodec {
        WireCodec::new(CodecConfig {
            max_frame_size_bytes: 64,
        })
    }

    fn sample_envelope() -> RawEnvelope {
        let mut envelope = RawEnvelope::new();
        envelope.insert("cmd".to_owned(), Value::Integer(1.into()));
        envelope.insert("block".to_owned(), Value::Boolean(true));
        envelope.insert("timeout".to_owned(), Value::Nil);
        envelope.insert("data".to_owned(), Value::Binary(vec![0xde, 0xad, 0xbe, 0xef]));
        envelope
    }

    #[test]
    fn frame_encodes_and_decodes_back() {
        let codec = WireCodec::default();
        let envelope = sample_envelope();
        let frame = codec.encode_frame(&envelope).expect("frame should encode");
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

        assert_eq!(declared, frame.len() - FRAME_HEADER_SIZE_BYTES);
        assert_eq!(codec.decode_frame(&frame).expect("frame should decode"), envelope);
    }

    #[test]
    fn reads_frames_split_across_many_reads() {
        let codec = WireCodec::default();
        let mut stream = codec.encode_frame(&sample_envelope()).expect("first frame");
        let mut second = RawEnvelope::new();
        second.insert("cmd".to_owned(), Value::Integer(3.into()));
        stream.extend(codec.encode_frame(&second).expect("second frame"));

        let mut reader = ChunkedReader {
            inner: Cursor::new(stream),
            chunk: 3,
        };

        let first = codec.read_frame(&mut reader).expect("first read");
        assert!(matches!(first, FrameRead::Frame(env) if env == sample_envelope()));
        let next = codec.read_frame(&mut reader).expect("second read");
        assert!(matches!(next, FrameRead::Frame(env) if env == second));
        let end = codec.read_frame(&mut reader).expect("clean eof");
        assert!(matches!(end, FrameRead::Closed));
    }

    #[test]
    fn eof_inside_header_is_truncation() {
        let codec = WireCodec::default();
        let mut reader = Cursor::new(vec![0_u8, 0]);
        let error = codec.read_frame(&mut reader).expect_err("partial header");
        assert!(matches!(error, CodecError::TruncatedHeader { received: 2 }));
    }

    #[test]
    fn eof_inside_body_is_truncation() {
        let codec = WireCodec::default();
        let frame = codec.encode_frame(&sample_envelope()).expect("frame should encode");
        let mut reader = Cursor::new(frame[..frame.len() - 2].to_vec());

        let error = codec.read_frame(&mut reader).expect_err("partial body");
        assert!(matches!(error, CodecError::TruncatedFrame { .. }));
    }

    #[test]
    fn large_declared_length_does_not_size_the_buffer_up_front() {
        let declared = DEFAULT_MAX_FRAME_SIZE_BYTES;
        let mut stream = (declared as u32).to_be_bytes().to_vec();
        stream.extend_from_slice(&[0x80; 10]);
        let mut reader = RecordingReader {
            inner: Cursor::new(stream),
            largest_request: 0,
        };

        let error = WireCodec::default()
            .read_frame(&mut reader)
            .expect_err("body ends early");
        assert!(matches!(error, CodecError::TruncatedFrame { declared: d } if d == declared));
        assert!(reader.largest_request <= BODY_READ_CHUNK_BYTES);
    }

    #[test]
    fn oversized_declaration_fails_before_reading_body() {
        let codec = small_codec();
        let mut reader = Cursor::new(1_000_u32.to_be_bytes().to_vec());

        let error = codec.read_frame(&mut reader).expect_err("length above limit");
        assert!(matches!(
            error,
            CodecError::ProtocolLengthTooLarge {
                length: 1_000,
                limit: 64
            }
        ));
    }

    #[test]
    fn rejects_zero_length_frame() {
        let error = WireCodec::default()
            .decode_frame(&[0_u8, 0, 0, 0])
            .expect_err("zero-length frame should fail");
        assert!(matches!(error, CodecError::ProtocolZeroLength));
    }

    #[test]
    fn rejects_payload_larger_than_limit_on_encode() {
        let mut envelope = RawEnvelope::new();
        envelope.insert("data".to_owned(), Value::Binary(vec![0x41; 65]));

        let error = small_codec()
            .encode_frame(&envelope)
            .expect_err("oversized payload should fail");
        assert!(matches!(error, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rejects_float_and_extension_values() {
        let codec = WireCodec::default();

        let mut floats = RawEnvelope::new();
        floats.insert("timeout".to_owned(), Value::F64(1.5));
        assert!(matches!(
            codec.encode_frame(&floats),
            Err(CodecError::FloatNotAllowed)
        ));

        let mut ext = RawEnvelope::new();
        ext.insert("data".to_owned(), Value::Ext(1, vec![1, 2, 3]));
        assert!(matches!(
            codec.encode_frame(&ext),
            Err(CodecError::ExtensionTypeNotAllowed)
        ));
    }

    #[test]
    fn rejects_unsigned_integers_above_i64() {
        let mut envelope = RawEnvelope::new();
        envelope.insert("max_size".to_owned(), Value::Integer((i64::MAX as u64 + 1).into()));

        let error = WireCodec::default()
            .encode_frame(&envelope)
            .expect_err("out-of-range int should be rejected");
        assert!(matches!(error, CodecError::IntegerOutOfRange));
    }

    #[test]
    fn rejects_non_map_and_non_string_keys() {
        let codec = WireCodec::default();

        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Array(vec![])).expect("array encodes");
        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::EnvelopeMustBeMap)
        ));

        let mut payload = Vec::new();
        let keyed = Value::Map(vec![(Value::Integer(1.into()), Value::Nil)]);
        rmpv::encode::write_value(&mut payload, &keyed).expect("map encodes");
        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::MapKeyMustBeUtf8String)
        ));
    }

    #[test]
    fn rejects_repeated_keys_at_any_depth() {
        let codec = WireCodec::default();

        let mut payload = Vec::new();
        let repeated = Value::Map(vec![
            (Value::from("cmd"), Value::Integer(1.into())),
            (Value::from("cmd"), Value::Integer(2.into())),
        ]);
        rmpv::encode::write_value(&mut payload, &repeated).expect("map encodes");
        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::DuplicateKey { key }) if key == "cmd"
        ));

        let mut payload = Vec::new();
        let nested = Value::Map(vec![(
            Value::from("args"),
            Value::Map(vec![
                (Value::from("block"), Value::Boolean(true)),
                (Value::from("block"), Value::Boolean(false)),
            ]),
        )]);
        rmpv::encode::write_value(&mut payload, &nested).expect("map encodes");
        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::DuplicateKey { key }) if key == "block"
        ));
    }

    #[test]
    fn rejects_trailing_data_in_payload() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Map(vec![])).expect("map encodes");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("nil encodes");

        let error = WireCodec::default()
            .decode_payload(&payload)
            .expect_err("trailing data should fail");
        assert!(matches!(error, CodecError::TrailingDataInPayload));
    }

    #[test]
    fn garbage_body_is_a_decode_error_not_a_hang() {
        let codec = WireCodec::default();
        let mut stream = 3_u32.to_be_bytes().to_vec();
        stream.extend_from_slice(&[0xc1, 0xc1, 0xc1]);

        let error = codec
            .read_frame(&mut Cursor::new(stream))
            .expect_err("reserved marker bytes are invalid");
        assert!(!error.is_transport());
    }

    #[test]
    fn max_frame_size_must_fit_header() {
        let error = WireCodec::try_new(CodecConfig {
            max_frame_size_bytes: 0,
        })
        .expect_err("zero limit is invalid");
        assert!(matches!(error, CodecError::InvalidMaxFrameSize { value: 0 }));
    }
}
