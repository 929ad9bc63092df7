use crate::frame::MAX_PAYLOAD_LEN;

/// Error type for frame encoding and decoding.
///
/// Every variant maps to a stable wire code that peers can match on without
/// parsing the human readable message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer does not describe a well-formed frame.
    #[error("invalid frame: {0}")]
    Invalid(&'static str),

    /// The payload could not be inflated, or the inflate stream expanded
    /// beyond the allowed ratio.
    #[error("payload decompression failed")]
    DecompressFailed,

    /// The payload could not be deciphered. Also returned when an encrypted
    /// frame arrives and no key is configured.
    #[error("payload decryption failed")]
    DecryptFailed,

    /// The payload exceeds [`MAX_PAYLOAD_LEN`] before or after decompression.
    #[error("payload exceeds the {MAX_PAYLOAD_LEN} byte cap")]
    PayloadTooLarge,

    /// The payload bytes are not the compact JSON the flags promised.
    #[error("error parsing payload: {0}")]
    PayloadParse(#[from] serde_json::Error),
}

impl FrameError {
    /// The stable wire code for this error, carried in ERROR frames.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::Invalid(_) => "frame_invalid",
            FrameError::DecompressFailed => "decompress_failed",
            FrameError::DecryptFailed => "decrypt_failed",
            FrameError::PayloadTooLarge => "payload_too_large",
            FrameError::PayloadParse(_) => "payload_parse_failed",
        }
    }
}
