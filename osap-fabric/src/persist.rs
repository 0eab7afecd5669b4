//! Root-name persistence blob.
//!
//! A device can keep a runtime rename across reboots by stashing this blob
//! in whatever non-volatile storage it has: a four-byte signature, a length,
//! and the name bytes. No storage driver lives here; byte slices go in and
//! out and the embedder owns the medium.

use crate::{NAME_MAX_LEN, error::FabricError};

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Signature leading a valid name blob.
pub const NAME_BLOB_SIGNATURE: [u8; 4] = *b"OSNB";

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct NameBlobHeader {
    signature: [u8; 4],
    len: U16,
}

/// Encode `name` into `out`, returning the blob length.
pub fn encode_name(name: &str, out: &mut [u8]) -> Result<usize, FabricError> {
    if name.len() > NAME_MAX_LEN {
        return Err(FabricError::BadPersistBlob);
    }
    let header = NameBlobHeader {
        signature: NAME_BLOB_SIGNATURE,
        len: U16::new(name.len() as u16),
    };
    let header_bytes = header.as_bytes();
    let total = header_bytes.len() + name.len();
    let Some(bytes) = out.get_mut(..total) else {
        return Err(FabricError::BadPersistBlob);
    };
    bytes[..header_bytes.len()].copy_from_slice(header_bytes);
    bytes[header_bytes.len()..].copy_from_slice(name.as_bytes());
    Ok(total)
}

/// Decode a blob back into a name; `None` when the signature, length, or
/// encoding doesn't hold up.
#[must_use]
pub fn decode_name(blob: &[u8]) -> Option<&str> {
    let (header, rest) = NameBlobHeader::read_from_prefix(blob).ok()?;
    if header.signature != NAME_BLOB_SIGNATURE {
        return None;
    }
    let len = usize::from(header.len.get());
    if len > NAME_MAX_LEN {
        return None;
    }
    let name = core::str::from_utf8(rest.get(..len)?).ok()?;
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_blob_roundtrip() {
        let mut blob = [0u8; 64];
        let len = encode_name("rt_gantry", &mut blob).unwrap();
        assert_eq!(len, 6 + 9);
        assert_eq!(&blob[..4], b"OSNB");
        assert_eq!(blob[4..6], [9, 0]);
        assert_eq!(decode_name(&blob[..len]), Some("rt_gantry"));
    }

    #[test]
    fn test_decode_rejects_wrong_signature() {
        let mut blob = [0u8; 16];
        let len = encode_name("rt_x", &mut blob).unwrap();
        blob[0] = b'X';
        assert_eq!(decode_name(&blob[..len]), None);
    }

    #[test]
    fn test_decode_rejects_truncated_blob() {
        let mut blob = [0u8; 16];
        let len = encode_name("rt_node", &mut blob).unwrap();
        assert_eq!(decode_name(&blob[..len - 2]), None);
    }

    #[test]
    fn test_encode_rejects_oversized_name() {
        let mut blob = [0u8; 64];
        let long = "rt_0123456789012345678901234567890123";
        assert!(encode_name(long, &mut blob).is_err());
    }
}
