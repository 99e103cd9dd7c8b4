//! Descriptor codecs
//!
//! Descriptors are stored either as JSON text (human readable, used for the
//! string form of an aggregate) or as MessagePack bytes (compact binary
//! snapshots).

use crate::{Descriptor, ProtocolError};
use bytes::Bytes;

/// Maximum encoded descriptor size (16MB)
pub const MAX_DESCRIPTOR_SIZE: usize = 16 * 1024 * 1024;

/// Encoding used for a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// JSON text
    Json,
    /// MessagePack binary
    #[cfg(feature = "rmp-serde")]
    MessagePack,
}

/// Encoder/decoder for [`Descriptor`] values
#[derive(Debug, Clone)]
pub struct DescriptorCodec {
    /// Encoding in use
    format: Format,
    /// Maximum encoded size accepted or produced
    max_size: usize,
}

impl Default for DescriptorCodec {
    fn default() -> Self {
        Self::json()
    }
}

impl DescriptorCodec {
    /// JSON codec
    pub fn json() -> Self {
        Self {
            format: Format::Json,
            max_size: MAX_DESCRIPTOR_SIZE,
        }
    }

    /// MessagePack codec
    #[cfg(feature = "rmp-serde")]
    pub fn msgpack() -> Self {
        Self {
            format: Format::MessagePack,
            max_size: MAX_DESCRIPTOR_SIZE,
        }
    }

    /// Override the size limit
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Encoding in use
    pub fn format(&self) -> Format {
        self.format
    }

    /// Encode a descriptor
    pub fn encode(&self, descriptor: &Descriptor) -> Result<Bytes, ProtocolError> {
        let encoded = match self.format {
            Format::Json => serde_json::to_vec(descriptor)?,
            #[cfg(feature = "rmp-serde")]
            Format::MessagePack => rmp_serde::to_vec_named(descriptor)?,
        };

        self.check_size(encoded.len())?;
        Ok(Bytes::from(encoded))
    }

    /// Decode a descriptor
    pub fn decode(&self, data: &[u8]) -> Result<Descriptor, ProtocolError> {
        self.check_size(data.len())?;

        let descriptor = match self.format {
            Format::Json => serde_json::from_slice(data)?,
            #[cfg(feature = "rmp-serde")]
            Format::MessagePack => rmp_serde::from_slice(data)?,
        };
        Ok(descriptor)
    }

    /// Encode a descriptor as JSON text
    pub fn to_json_string(descriptor: &Descriptor) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(descriptor)?)
    }

    /// Decode a descriptor from JSON text
    pub fn from_json_str(text: &str) -> Result<Descriptor, ProtocolError> {
        Self::json().decode(text.as_bytes())
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_size {
            return Err(ProtocolError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}
