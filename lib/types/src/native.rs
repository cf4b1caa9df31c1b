//! Fixed-width values, strings, sequences, and constant checks.
//!
//! These are the small helpers the module reader/writer layers on top of
//! the varint codec: little-endian native values, varuint32-length-prefixed
//! strings and sequences, and "this exact value must be here" checks for
//! magic numbers and version fields.

use crate::error::SerializeError;
use crate::stream::{InputStream, OutputStream};
use crate::varint::{read_varuint32, write_varuint32};

/// Writes a single byte.
pub fn write_u8(stream: &mut OutputStream, value: u8) {
    stream.advance(1)[0] = value;
}

/// Reads a single byte.
pub fn read_u8(stream: &mut InputStream<'_>) -> Result<u8, SerializeError> {
    Ok(stream.advance(1)?[0])
}

macro_rules! native_value {
    ($(#[$doc:meta])* $write_fn:ident, $read_fn:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $write_fn(stream: &mut OutputStream, value: $ty) {
            stream
                .advance(std::mem::size_of::<$ty>())
                .copy_from_slice(&value.to_le_bytes());
        }

        $(#[$doc])*
        pub fn $read_fn(stream: &mut InputStream<'_>) -> Result<$ty, SerializeError> {
            let bytes = stream.advance(std::mem::size_of::<$ty>())?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().unwrap()))
        }
    };
}

native_value!(
    /// A little-endian `u32`.
    write_u32,
    read_u32,
    u32
);
native_value!(
    /// A little-endian `u64`.
    write_u64,
    read_u64,
    u64
);
native_value!(
    /// A little-endian IEEE 754 `f32`.
    write_f32,
    read_f32,
    f32
);
native_value!(
    /// A little-endian IEEE 754 `f64`.
    write_f64,
    read_f64,
    f64
);

/// Writes a varuint32 length followed by the string bytes.
pub fn write_string(stream: &mut OutputStream, value: &str) -> Result<(), SerializeError> {
    write_varuint32(stream, value.len() as u32)?;
    stream.write_bytes(value.as_bytes());
    Ok(())
}

/// Reads a varuint32 length followed by that many UTF-8 bytes.
pub fn read_string(stream: &mut InputStream<'_>) -> Result<String, SerializeError> {
    let num_bytes = read_varuint32(stream)? as usize;
    let bytes = stream.advance(num_bytes)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| SerializeError::InvalidUtf8)
}

/// Writes a varuint32 element count followed by each element.
pub fn write_sequence<T>(
    stream: &mut OutputStream,
    items: &[T],
    mut write_element: impl FnMut(&mut OutputStream, &T) -> Result<(), SerializeError>,
) -> Result<(), SerializeError> {
    write_varuint32(stream, items.len() as u32)?;
    for item in items {
        write_element(stream, item)?;
    }
    Ok(())
}

/// Reads a varuint32 element count followed by that many elements.
pub fn read_sequence<T>(
    stream: &mut InputStream<'_>,
    mut read_element: impl FnMut(&mut InputStream<'_>) -> Result<T, SerializeError>,
) -> Result<Vec<T>, SerializeError> {
    let count = read_varuint32(stream)? as usize;
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(read_element(stream)?);
    }
    Ok(items)
}

/// Reads a little-endian `u32` and checks it against a known constant.
///
/// `message` names the constant in the mismatch error, e.g. "magic number".
pub fn expect_u32_constant(
    stream: &mut InputStream<'_>,
    message: &str,
    expected: u32,
) -> Result<(), SerializeError> {
    let loaded = read_u32(stream)?;
    if loaded != expected {
        return Err(SerializeError::ConstantMismatch {
            message: message.to_string(),
            loaded: u64::from(loaded),
            expected: u64::from(expected),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_values_are_little_endian() {
        let mut out = OutputStream::new();
        write_u32(&mut out, 0x11223344);
        write_u64(&mut out, 1);
        let bytes = out.into_bytes();
        assert_eq!(&bytes[..4], [0x44, 0x33, 0x22, 0x11]);

        let mut input = InputStream::new(&bytes);
        assert_eq!(read_u32(&mut input).unwrap(), 0x11223344);
        assert_eq!(read_u64(&mut input).unwrap(), 1);
    }

    #[test]
    fn string_round_trip() {
        let mut out = OutputStream::new();
        write_string(&mut out, "functionDef0").unwrap();
        let bytes = out.into_bytes();
        assert_eq!(bytes[0], 12);

        let mut input = InputStream::new(&bytes);
        assert_eq!(read_string(&mut input).unwrap(), "functionDef0");
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let bytes = [2u8, 0xff, 0xfe];
        let mut input = InputStream::new(&bytes);
        assert_eq!(
            read_string(&mut input),
            Err(SerializeError::InvalidUtf8)
        );
    }

    #[test]
    fn sequence_round_trip() {
        let mut out = OutputStream::new();
        write_sequence(&mut out, &[10u32, 20, 30], |stream, &item| {
            crate::varint::write_varuint32(stream, item)
        })
        .unwrap();
        let bytes = out.into_bytes();

        let mut input = InputStream::new(&bytes);
        let items = read_sequence(&mut input, crate::varint::read_varuint32).unwrap();
        assert_eq!(items, [10, 20, 30]);
    }

    #[test]
    fn constant_mismatch_reports_both_values() {
        let mut out = OutputStream::new();
        write_u32(&mut out, 0x6d736100);
        let bytes = out.into_bytes();

        let mut input = InputStream::new(&bytes);
        let err = expect_u32_constant(&mut input, "magic number", 0xdeadbeef).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "magic number: loaded {} but was expecting {}",
                0x6d736100u32, 0xdeadbeefu32
            )
        );
    }
}
