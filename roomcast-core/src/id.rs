use std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
};

use base64::Engine;
use rand::Rng;

/// A 128 bit socket id represented as a 16 char url-safe base64 string.
///
/// Ids are generated from 12 random bytes on upgrade and are unique for the
/// lifetime of the process. They are copied freely: the type is `Copy` and
/// fits in two machine words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId([u8; 16]);

impl SocketId {
    /// Generates a new random socket id.
    pub fn new() -> Self {
        let mut random = [0u8; 12]; // 12 bytes = 16 chars base64
        let mut id = [0u8; 16];

        rand::thread_rng().fill(&mut random);

        base64::prelude::BASE64_URL_SAFE_NO_PAD
            .encode_slice(random, &mut id)
            .unwrap();

        SocketId(id)
    }

    fn as_str(&self) -> &str {
        // SAFETY: the id is always built from base64 chars
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocketIdParseError {
    #[error("invalid url base64 string")]
    InvalidBase64String,
    #[error("invalid socket id length")]
    InvalidLength,
}

impl FromStr for SocketId {
    type Err = SocketIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use SocketIdParseError::*;

        if s.len() != 16 {
            return Err(InvalidLength);
        }

        let mut id = [0u8; 16];
        for (i, byte) in s.as_bytes()[0..16].iter().enumerate() {
            if byte.is_ascii_alphanumeric() || *byte == b'_' || *byte == b'-' {
                id[i] = *byte;
            } else {
                return Err(InvalidBase64String);
            }
        }
        Ok(SocketId(id))
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for SocketId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct SocketIdVisitor;
impl serde::de::Visitor<'_> for SocketIdVisitor {
    type Value = SocketId;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a 16 char url-safe base64 socket id")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        SocketId::from_str(v).map_err(serde::de::Error::custom)
    }
}
impl<'de> serde::Deserialize<'de> for SocketId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(SocketIdVisitor)
    }
}
