//! # Utility Functions and Types
//!
//! Common utilities used throughout the tskit library:
//!
//! - Big/little-endian integer decoding over byte slices (the PCAP and
//!   network layers switch endianness at run time)
//! - Bit-level reads for picture and PES header fields
//! - MPEG-2 CRC32 for PSI table generation
//!
//! ## Endian decoding
//!
//! ```rust
//! use tskit::utils::{get_u32_be, get_u32_le};
//!
//! let data = [0xA1, 0xB2, 0xC3, 0xD4];
//! assert_eq!(get_u32_be(&data), 0xA1B2C3D4);
//! assert_eq!(get_u32_le(&data), 0xD4C3B2A1);
//! ```

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// Big/little-endian slice decoders
pub mod bytes;

/// CRC calculation implementations
pub mod crc;

// Re-export commonly used types
pub use bits::BitReader;
pub use bytes::*;
pub use crc::Crc32Mpeg2;
