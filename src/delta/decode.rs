//! Decoder for Git delta instruction streams; rebuilds a target object from
//! a base buffer and the instructions produced by `delta::encode` (or by
//! whatever wrote a pack this crate reads back).

use std::io::{ErrorKind, Read};

use crate::errors::BridgeError;
use crate::utils::{read_bytes, read_partial_int, read_size_encoding};

const COPY_INSTRUCTION_FLAG: u8 = 1 << 7; // msb set => copy from base
const COPY_OFFSET_BYTES: u8 = 4;
const COPY_SIZE_BYTES: u8 = 3;
const COPY_ZERO_SIZE: usize = 0x10000;

/// Apply a delta stream to `base`, returning the reconstructed target bytes.
/// The stream format matches Git's delta encoding:
/// - leading base size, then result size (varint)
/// - sequence of ops: data instructions (msb=0, lower 7 bits = literal
///   length) or copy instructions (msb=1, following bytes encode
///   offset/size).
pub fn delta_decode(stream: &mut impl Read, base: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let base_size = read_size_encoding(stream)?;
    if base.len() != base_size {
        return Err(BridgeError::DeltaError(format!(
            "base length {} does not match declared {}",
            base.len(),
            base_size
        )));
    }

    let result_size = read_size_encoding(stream)?;
    let mut buffer = Vec::with_capacity(result_size);
    loop {
        // Stream end means the target object is complete.
        let instruction = match read_bytes(stream) {
            Ok([instruction]) => instruction,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };

        if instruction & COPY_INSTRUCTION_FLAG == 0 {
            // Data instruction; the instruction byte is the literal length.
            if instruction == 0 {
                return Err(BridgeError::DeltaError(
                    "zero-length data instruction".into(),
                ));
            }
            let mut data = vec![0; instruction as usize];
            stream.read_exact(&mut data)?;
            buffer.extend_from_slice(&data);
        } else {
            let mut nonzero_bytes = instruction;
            let offset = read_partial_int(stream, COPY_OFFSET_BYTES, &mut nonzero_bytes)?;
            let mut size = read_partial_int(stream, COPY_SIZE_BYTES, &mut nonzero_bytes)?;
            if size == 0 {
                // A zero size field means the fixed 64 KiB copy length.
                size = COPY_ZERO_SIZE;
            }
            let data = base.get(offset..offset + size).ok_or_else(|| {
                BridgeError::DeltaError(format!(
                    "copy instruction [{offset}, {}) outside base of {} bytes",
                    offset + size,
                    base.len()
                ))
            })?;
            buffer.extend_from_slice(data);
        }
    }
    if buffer.len() != result_size {
        return Err(BridgeError::DeltaError(format!(
            "reconstructed {} bytes, expected {result_size}",
            buffer.len()
        )));
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::delta_decode;
    use crate::delta::encode::DeltaDiff;
    use crate::errors::BridgeError;

    /// Delta encode + decode round-trips to the new buffer.
    #[test]
    fn test_round_trip_matches_target() {
        let old = b"hello world";
        let new = b"hello rust";
        let delta = DeltaDiff::new(old, new).encode();
        let mut cursor = Cursor::new(delta);
        assert_eq!(delta_decode(&mut cursor, old).unwrap(), new);
    }

    /// Mismatched base length is a delta error, not a panic.
    #[test]
    fn test_base_size_mismatch() {
        let old = b"abcde";
        let new = b"abXYZ";
        let delta = DeltaDiff::new(old, new).encode();
        let mut cursor = Cursor::new(delta);
        let err = delta_decode(&mut cursor, b"xx").unwrap_err();
        assert!(matches!(err, BridgeError::DeltaError(_)));
    }

    /// A copy instruction past the end of the base is rejected.
    #[test]
    fn test_copy_out_of_bounds() {
        // base size 2, result size 5, copy offset 0 size 5
        let raw = vec![2u8, 5, 0x90, 5];
        let mut cursor = Cursor::new(raw);
        let err = delta_decode(&mut cursor, b"ab").unwrap_err();
        assert!(matches!(err, BridgeError::DeltaError(_)));
    }
}
