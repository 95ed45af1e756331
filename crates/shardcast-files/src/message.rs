//! Part message framing.
//!
//! A part message is the plaintext that gets encrypted into one network
//! message: the part number followed by the part data, padded so that every
//! message is exactly `max_payload` bytes.

use crate::{FilesError, PART_HEADER_LEN};

/// Decoded part message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMessage<'a> {
    /// Index of the part within its transfer
    pub part_num: u16,
    /// Part data, including any trailing padding
    pub part: &'a [u8],
}

impl<'a> PartMessage<'a> {
    /// Usable part size for a message of `max_payload` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::MessageTooShort`] if the payload cannot hold the
    /// header plus at least one byte of data.
    pub fn part_size(max_payload: usize) -> Result<usize, FilesError> {
        if max_payload <= PART_HEADER_LEN {
            return Err(FilesError::MessageTooShort {
                len: max_payload,
                min: PART_HEADER_LEN + 1,
            });
        }
        Ok(max_payload - PART_HEADER_LEN)
    }

    /// Build a part message of exactly `max_payload` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the part does not fit.
    pub fn encode(part_num: u16, part: &[u8], max_payload: usize) -> Result<Vec<u8>, FilesError> {
        let max = Self::part_size(max_payload)?;
        if part.len() > max {
            return Err(FilesError::PartTooLarge {
                len: part.len(),
                max,
            });
        }

        let mut message = vec![0u8; max_payload];
        message[..PART_HEADER_LEN].copy_from_slice(&part_num.to_be_bytes());
        message[PART_HEADER_LEN..PART_HEADER_LEN + part.len()].copy_from_slice(part);
        Ok(message)
    }

    /// Parse a part message.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::MessageTooShort`] if the header is truncated.
    pub fn decode(message: &'a [u8]) -> Result<Self, FilesError> {
        if message.len() < PART_HEADER_LEN {
            return Err(FilesError::MessageTooShort {
                len: message.len(),
                min: PART_HEADER_LEN,
            });
        }

        let part_num = u16::from_be_bytes([message[0], message[1]]);
        Ok(Self {
            part_num,
            part: &message[PART_HEADER_LEN..],
        })
    }
}
