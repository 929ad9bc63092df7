//! Binary frame codec: a pair of pure functions over byte buffers.
//!
//! Encoding serialises a [`Frame`] to the wire layout, DEFLATE-compressing
//! payloads above the configured threshold and optionally enciphering them
//! with AES-256-CBC under a pre-shared key. Decoding reverses the transforms
//! in the opposite order: decrypt, then inflate, then parse.
//!
//! Compression is always applied before encryption. Encryption without
//! compression is legal (payloads under the threshold); the reverse order
//! never appears on the wire.

use std::io::{Read, Write};

use aes::Aes256;
use bytes::{BufMut, Bytes, BytesMut};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use rand::Rng;
use serde_json::Value;

use crate::errors::FrameError;
use crate::frame::{
    flags, Frame, FrameType, Payload, DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD,
    MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// An inflate stream may not expand to more than this many times its
/// compressed size; anything past that is treated as a zip bomb.
const MAX_INFLATE_RATIO: usize = 1024;

const IV_LEN: usize = 16;

/// Codec parameters shared by every frame on a connection.
///
/// Both peers must agree on `encryption_key`; the compression settings only
/// affect the encode side, any conforming decoder accepts both compressed
/// and plain payloads.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Minimum payload size in bytes before DEFLATE kicks in.
    pub compression_threshold: usize,
    /// DEFLATE level, 1..=9.
    pub compression_level: u32,
    /// Pre-shared AES-256 key. `None` disables encryption entirely.
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            encryption_key: None,
        }
    }
}

/// Encodes a frame to its wire representation.
pub fn encode(frame: &Frame, config: &CodecConfig) -> Result<Bytes, FrameError> {
    let mut flag_bits = 0u8;

    let mut payload: Vec<u8> = match &frame.payload {
        Payload::Json(Value::Null) => Vec::new(),
        Payload::Json(value) => serde_json::to_vec(value)?,
        Payload::Binary(bytes) => {
            flag_bits |= flags::BINARY;
            bytes.to_vec()
        }
    };
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge);
    }

    if payload.len() > config.compression_threshold {
        payload = deflate(&payload, config.compression_level)?;
        flag_bits |= flags::COMPRESSED;
    }
    if let Some(key) = &config.encryption_key {
        payload = encrypt(&payload, key)?;
        flag_bits |= flags::ENCRYPTED;
    }

    let ack_id = match frame.ty {
        FrameType::Ack => Some(
            frame
                .ack_id
                .ok_or(FrameError::Invalid("ack frame without an ack id"))?,
        ),
        _ => frame.ack_id.map(|id| {
            flag_bits |= flags::ACK_REQUESTED;
            id
        }),
    };

    if frame.ns.len() > u16::MAX as usize {
        return Err(FrameError::Invalid("namespace path too long"));
    }
    if frame.event.len() > u16::MAX as usize {
        return Err(FrameError::Invalid("event name too long"));
    }

    let mut buf = BytesMut::with_capacity(
        3 + 2 + frame.ns.len() + 2 + frame.event.len() + 4 + 4 + payload.len(),
    );
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(frame.ty as u8);
    buf.put_u8(flag_bits);
    buf.put_u16(frame.ns.len() as u16);
    buf.put_slice(frame.ns.as_bytes());
    buf.put_u16(frame.event.len() as u16);
    buf.put_slice(frame.event.as_bytes());
    if let Some(id) = ack_id {
        buf.put_u32(id);
    }
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decodes a frame from its wire representation.
pub fn decode(buf: &[u8], config: &CodecConfig) -> Result<Frame, FrameError> {
    let mut reader = Reader { buf, pos: 0 };

    let version = reader.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::Invalid("unsupported protocol version"));
    }
    let ty = FrameType::from_u8(reader.u8()?).ok_or(FrameError::Invalid("unknown frame type"))?;
    let flag_bits = reader.u8()?;
    if flag_bits & flags::RESERVED_MASK != 0 {
        return Err(FrameError::Invalid("reserved flag bits set"));
    }

    let ns_len = reader.u16()? as usize;
    let ns = std::str::from_utf8(reader.bytes(ns_len)?)
        .map_err(|_| FrameError::Invalid("namespace is not valid utf-8"))?
        .to_owned();
    let event_len = reader.u16()? as usize;
    let event = std::str::from_utf8(reader.bytes(event_len)?)
        .map_err(|_| FrameError::Invalid("event name is not valid utf-8"))?
        .to_owned();

    let ack_id = if flag_bits & flags::ACK_REQUESTED != 0 || ty == FrameType::Ack {
        Some(reader.u32()?)
    } else {
        None
    };

    let payload_len = reader.u32()? as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge);
    }
    let mut payload = reader.bytes(payload_len)?.to_vec();
    if reader.pos != buf.len() {
        return Err(FrameError::Invalid("trailing bytes after payload"));
    }

    if flag_bits & flags::ENCRYPTED != 0 {
        let key = config
            .encryption_key
            .as_ref()
            .ok_or(FrameError::DecryptFailed)?;
        payload = decrypt(&payload, key)?;
    }
    if flag_bits & flags::COMPRESSED != 0 {
        payload = inflate(&payload)?;
    }

    let payload = if flag_bits & flags::BINARY != 0 {
        Payload::Binary(Bytes::from(payload))
    } else if payload.is_empty() {
        Payload::Json(Value::Null)
    } else {
        Payload::Json(serde_json::from_slice(&payload)?)
    };

    Ok(Frame {
        ty,
        ns,
        event,
        ack_id,
        payload,
    })
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, FrameError> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(level.clamp(1, 9)),
    );
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|_| FrameError::Invalid("deflate stream error"))
}

/// Bounded inflate: output may exceed neither [`MAX_PAYLOAD_LEN`] nor
/// [`MAX_INFLATE_RATIO`] times the compressed input.
fn inflate(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let ratio_cap = data.len().saturating_mul(MAX_INFLATE_RATIO);
    let cap = MAX_PAYLOAD_LEN.min(ratio_cap);

    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = decoder
            .read(&mut chunk)
            .map_err(|_| FrameError::DecompressFailed)?;
        if n == 0 {
            break;
        }
        if out.len() + n > cap {
            return Err(if out.len() + n > MAX_PAYLOAD_LEN {
                FrameError::PayloadTooLarge
            } else {
                FrameError::DecompressFailed
            });
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

fn encrypt(plain: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, FrameError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| FrameError::Invalid("bad encryption key length"))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, FrameError> {
    if data.len() < IV_LEN + 16 || (data.len() - IV_LEN) % 16 != 0 {
        return Err(FrameError::DecryptFailed);
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    let cipher =
        Aes256CbcDec::new_from_slices(key, iv).map_err(|_| FrameError::DecryptFailed)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| FrameError::DecryptFailed)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(FrameError::Invalid("truncated frame"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key() -> [u8; 32] {
        *b"0123456789abcdef0123456789abcdef"
    }

    #[test]
    fn event_roundtrip_plain() {
        let config = CodecConfig::default();
        let frame = Frame::event("/chat", "say", json!({"room": "R1", "text": "hi"}));
        let bytes = encode(&frame, &config).unwrap();
        let decoded = decode(&bytes, &config).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn ack_requested_flag_carries_the_id() {
        let config = CodecConfig::default();
        let frame = Frame::event("/", "save", json!({"k": 1})).with_ack_id(42);
        let bytes = encode(&frame, &config).unwrap();
        assert_eq!(bytes[2] & flags::ACK_REQUESTED, flags::ACK_REQUESTED);
        let decoded = decode(&bytes, &config).unwrap();
        assert_eq!(decoded.ack_id, Some(42));
    }

    #[test]
    fn ack_frame_roundtrip() {
        let config = CodecConfig::default();
        let frame = Frame::ack("/chat", 7, json!({"ok": true}));
        let bytes = encode(&frame, &config).unwrap();
        // ACK frames carry the id without the ack-requested flag
        assert_eq!(bytes[2] & flags::ACK_REQUESTED, 0);
        let decoded = decode(&bytes, &config).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_decodes_to_null() {
        let config = CodecConfig::default();
        let bytes = encode(&Frame::heartbeat(), &config).unwrap();
        let decoded = decode(&bytes, &config).unwrap();
        assert_eq!(decoded.ty, FrameType::Heartbeat);
        assert_eq!(decoded.payload, Payload::Json(Value::Null));
    }

    #[test]
    fn binary_payload_roundtrip() {
        let config = CodecConfig::default();
        let frame = Frame::binary_event("/", "blob", Bytes::from_static(&[0, 1, 2, 255]));
        let decoded = decode(&encode(&frame, &config).unwrap(), &config).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn large_payload_is_compressed() {
        let config = CodecConfig::default();
        let text = "a".repeat(8 * 1024);
        let frame = Frame::event("/", "big", json!({ "text": text }));
        let bytes = encode(&frame, &config).unwrap();
        assert_eq!(bytes[2] & flags::COMPRESSED, flags::COMPRESSED);
        // highly repetitive payload must actually shrink
        assert!(bytes.len() < 4 * 1024);
        assert_eq!(decode(&bytes, &config).unwrap(), frame);
    }

    #[test]
    fn compressed_and_encrypted_roundtrip() {
        // 4 KB payload, 1 KB threshold, encryption on: both flags set
        let config = CodecConfig {
            compression_threshold: 1024,
            encryption_key: Some(key()),
            ..Default::default()
        };
        let items: Vec<Value> = (0..256)
            .map(|i| json!({"idx": i, "name": format!("entry-{i}"), "flag": i % 2 == 0}))
            .collect();
        let frame = Frame::event("/data", "bulk", Value::Array(items));
        let bytes = encode(&frame, &config).unwrap();
        assert_eq!(bytes[2] & flags::COMPRESSED, flags::COMPRESSED);
        assert_eq!(bytes[2] & flags::ENCRYPTED, flags::ENCRYPTED);
        assert_eq!(decode(&bytes, &config).unwrap(), frame);
    }

    #[test]
    fn encryption_only_roundtrip() {
        let config = CodecConfig {
            encryption_key: Some(key()),
            ..Default::default()
        };
        let frame = Frame::event("/", "small", json!({"v": 1}));
        let bytes = encode(&frame, &config).unwrap();
        assert_eq!(bytes[2] & flags::COMPRESSED, 0);
        assert_eq!(bytes[2] & flags::ENCRYPTED, flags::ENCRYPTED);
        assert_eq!(decode(&bytes, &config).unwrap(), frame);
    }

    #[test]
    fn encrypted_frame_without_key_fails() {
        let sender = CodecConfig {
            encryption_key: Some(key()),
            ..Default::default()
        };
        let bytes = encode(&Frame::event("/", "e", json!(1)), &sender).unwrap();
        let err = decode(&bytes, &CodecConfig::default()).unwrap_err();
        assert!(matches!(err, FrameError::DecryptFailed));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let sender = CodecConfig {
            encryption_key: Some(key()),
            ..Default::default()
        };
        let mut other = key();
        other[0] ^= 0xff;
        let receiver = CodecConfig {
            encryption_key: Some(other),
            ..Default::default()
        };
        let bytes = encode(&Frame::event("/", "e", json!({"secret": true})), &sender).unwrap();
        let err = decode(&bytes, &receiver).unwrap_err();
        // either the padding check or the JSON parse catches the garbage
        assert!(matches!(
            err,
            FrameError::DecryptFailed | FrameError::PayloadParse(_)
        ));
    }

    #[test]
    fn rejects_wrong_version() {
        let config = CodecConfig::default();
        let mut bytes = encode(&Frame::heartbeat(), &config).unwrap().to_vec();
        bytes[0] = 2;
        let err = decode(&bytes, &config).unwrap_err();
        assert!(matches!(err, FrameError::Invalid(_)));
        assert_eq!(err.code(), "frame_invalid");
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let config = CodecConfig::default();
        let mut bytes = encode(&Frame::heartbeat(), &config).unwrap().to_vec();
        bytes[2] |= 0b0000_0001;
        assert!(matches!(
            decode(&bytes, &config),
            Err(FrameError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_truncated_frame() {
        let config = CodecConfig::default();
        let bytes = encode(&Frame::event("/", "e", json!({"a": 1})), &config).unwrap();
        for len in 0..bytes.len() {
            assert!(decode(&bytes[..len], &config).is_err(), "len {len}");
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let config = CodecConfig::default();
        let mut bytes = encode(&Frame::heartbeat(), &config).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes, &config),
            Err(FrameError::Invalid(_))
        ));
    }

    #[test]
    fn inflate_is_bounded_against_bombs() {
        // 20 MiB of zeros deflates to a few KiB; inflating it back must hit
        // the 16 MiB cap instead of materialising the whole payload.
        let compressed = deflate(&vec![0u8; 20 * 1024 * 1024], 6).unwrap();
        let config = CodecConfig::default();

        let mut bytes = BytesMut::new();
        bytes.put_u8(PROTOCOL_VERSION);
        bytes.put_u8(FrameType::Event as u8);
        bytes.put_u8(flags::COMPRESSED);
        bytes.put_u16(1);
        bytes.put_slice(b"/");
        bytes.put_u16(4);
        bytes.put_slice(b"bomb");
        bytes.put_u32(compressed.len() as u32);
        bytes.put_slice(&compressed);

        let err = decode(&bytes, &config).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge | FrameError::DecompressFailed
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_on_encode() {
        let config = CodecConfig::default();
        let frame = Frame::binary_event("/", "big", Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]));
        assert!(matches!(
            encode(&frame, &config),
            Err(FrameError::PayloadTooLarge)
        ));
    }
}
