//! Frame encoding detection.
//!
//! Peer links carry two encodings:
//! - **JSON**: handshake, presence and leave frames
//! - **Bincode**: sync frames (deltas, version vectors, catch-up updates)
//!
//! A JSON object always starts with `{`; bincode frames start with a
//! little-endian variant tag, which is never `{` for our enums.

/// Encoding of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Bincode,
    Empty,
}

/// Detect the encoding from the first byte.
pub fn detect_encoding(data: &[u8]) -> Encoding {
    match data.first() {
        Some(b'{') => Encoding::Json,
        Some(_) => Encoding::Bincode,
        None => Encoding::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_json_object() {
        let data = br#"{"type":"presence","peerId":1}"#;
        assert_eq!(detect_encoding(data), Encoding::Json);
    }

    #[test]
    fn test_detect_bincode() {
        // Variant tag 0 as little-endian u32.
        let data = vec![0x00, 0x00, 0x00, 0x00, 0x05];
        assert_eq!(detect_encoding(&data), Encoding::Bincode);
    }

    #[test]
    fn test_detect_empty() {
        assert_eq!(detect_encoding(&[]), Encoding::Empty);
    }
}
