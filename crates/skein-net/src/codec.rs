//! Fixed 4-byte frame header shared by every packet on the wire.
//!
//! ```text
//! +-------------------+-------------------+--------------------+
//! | total size (2 B)  |  opcode (2 B)     |   payload          |
//! | u16 little-endian |  u16 little-endian|   (size - 4 bytes) |
//! +-------------------+-------------------+--------------------+
//! ```
//!
//! `total size` counts the header itself, so a valid frame always declares
//! at least [`HEADER_SIZE`]. These functions do no validation — bounds and
//! sanity checks belong to the connection's frame parser.

/// Size in bytes of the `total size` field.
pub const SIZE_FIELD_LEN: usize = 2;
/// Size in bytes of the `opcode` field.
pub const OPCODE_FIELD_LEN: usize = 2;
/// Total header size prepended to every frame.
pub const HEADER_SIZE: usize = SIZE_FIELD_LEN + OPCODE_FIELD_LEN;

/// Read the declared total frame size (header included) from a header.
///
/// The slice must be at least [`SIZE_FIELD_LEN`] bytes.
#[inline]
pub fn parse_size(header: &[u8]) -> u16 {
    u16::from_le_bytes([header[0], header[1]])
}

/// Read the opcode from a header. The slice must be at least
/// [`HEADER_SIZE`] bytes.
#[inline]
pub fn parse_opcode(header: &[u8]) -> u16 {
    u16::from_le_bytes([header[2], header[3]])
}

/// Write `total_size` and `opcode` into the first [`HEADER_SIZE`] bytes of
/// `header`.
#[inline]
pub fn write_header(header: &mut [u8], total_size: u16, opcode: u16) {
    header[..SIZE_FIELD_LEN].copy_from_slice(&total_size.to_le_bytes());
    header[SIZE_FIELD_LEN..HEADER_SIZE].copy_from_slice(&opcode.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut buf = [0u8; HEADER_SIZE];
        for &(size, opcode) in &[
            (4u16, 0u16),
            (4, 1),
            (5, 42),
            (1448, 9),
            (u16::MAX, u16::MAX),
            (0, 65534),
        ] {
            write_header(&mut buf, size, opcode);
            assert_eq!(parse_size(&buf), size);
            assert_eq!(parse_opcode(&buf), opcode);
        }
    }

    #[test]
    fn test_header_is_little_endian() {
        let mut buf = [0u8; HEADER_SIZE];
        write_header(&mut buf, 0x0102, 0x0304);
        assert_eq!(buf, [0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_parse_ignores_trailing_payload() {
        let mut buf = [0u8; 16];
        write_header(&mut buf, 16, 7);
        buf[HEADER_SIZE..].fill(0xAB);
        assert_eq!(parse_size(&buf), 16);
        assert_eq!(parse_opcode(&buf), 7);
    }
}
