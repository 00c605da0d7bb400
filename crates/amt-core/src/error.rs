//! Error types for AMT message decoding.

use thiserror::Error;

/// Errors raised while decoding relay messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Message too short to parse
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Message type byte is not an AMT message type
    #[error("unknown AMT message type: {0}")]
    UnknownType(u8),

    /// Valid AMT message, but not the one being waited for
    #[error("unexpected AMT message: expected type {expected}, got {actual}")]
    UnexpectedType {
        /// Type that was expected
        expected: u8,
        /// Type that was received
        actual: u8,
    },

    /// Nonce does not match the one sent
    #[error("nonce mismatch: sent 0x{expected:08X}, received 0x{actual:08X}")]
    NonceMismatch {
        /// Nonce carried by the last request
        expected: u32,
        /// Nonce carried by the response
        actual: u32,
    },

    /// Encapsulated IP header is malformed (version/IHL byte)
    #[error("invalid encapsulated IP header: version/ihl 0x{0:02X}")]
    InvalidIpHeader(u8),

    /// IGMPv3 group record type outside 1..=6
    #[error("unknown IGMPv3 group record type: {0}")]
    UnknownRecordType(u8),

    /// Encapsulated IGMP message is not a membership query
    #[error("encapsulated IGMP message is not a membership query: type 0x{0:02X}")]
    NotGeneralQuery(u8),
}

impl CodecError {
    pub(crate) fn check_len(data: &[u8], expected: usize) -> Result<(), CodecError> {
        if data.len() < expected {
            return Err(CodecError::TooShort {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}
