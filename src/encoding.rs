//! Bincode is used to encode messages on the peer wire protocol and the local
//! client protocol. It is a Rust-specific encoding that depends on the
//! internal data structures being stable, but both ends of a toyraft cluster
//! run the same build, so that's sufficient here. See:
//! https://github.com/bincode-org/bincode
//!
//! This module wraps the bincode crate to change the default options, in
//! particular to use variable-length rather than fixed-length integers.
//! Confusingly, upstream bincode::(de)serialize uses different options (fixed)
//! than DefaultOptions (variable) -- this module always uses DefaultOptions.
//!
//! The on-disk metadata format does NOT go through this module; it is a
//! bit-exact page layout written with explicit little-endian fields, see
//! the storage module.

use bincode::Options as _;

use crate::error::{Error, Result};

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value from a byte slice using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Deserializes a value from a reader using Bincode, or returns None if the
/// reader is closed or a read deadline expires before a value arrives.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match bincode().deserialize_from(reader) {
        Ok(t) => Ok(Some(t)),
        Err(err) => match *err {
            bincode::ErrorKind::Io(err) => match err.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                std::io::ErrorKind::ConnectionReset => Ok(None),
                std::io::ErrorKind::WouldBlock => Ok(None),
                std::io::ErrorKind::TimedOut => Ok(None),
                _ => Err(Error::from(err)),
            },
            err => Err(Error::from(Box::new(err))),
        },
    }
}

/// Serializes a value to a byte vector using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

/// Serializes a value to a writer using Bincode.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(bincode().serialize_into(writer, value)?)
}
