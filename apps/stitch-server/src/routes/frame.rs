//! Binary chunk frames for the websocket binding.
//!
//! Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON ChunkHeader][rest: chunk body]`

use crate::upload::{ChunkHeader, UploadError};

/// Largest accepted JSON header
pub const MAX_HEADER_LEN: usize = 4 * 1024;

/// Parse a binary frame into its header and a borrowed chunk body
pub fn parse_chunk_frame(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), FrameError> {
    let Some((len_bytes, rest)) = frame.split_first_chunk::<4>() else {
        return Err(FrameError::TooShort);
    };

    let header_len = u32::from_be_bytes(*len_bytes) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(FrameError::HeaderTooLarge(header_len));
    }
    if rest.len() < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, body) = rest.split_at(header_len);
    let header: ChunkHeader =
        serde_json::from_slice(header_bytes).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

    Ok((header, body))
}

/// Encode a chunk frame
pub fn encode_chunk_frame(header: &ChunkHeader, body: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + body.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Errors from binary frame parsing
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header length {0} exceeds limit")]
    HeaderTooLarge(usize),

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}

impl From<FrameError> for UploadError {
    fn from(e: FrameError) -> Self {
        UploadError::InvalidRequest(format!("bad chunk frame: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(index: u64) -> ChunkHeader {
        ChunkHeader {
            hash: "abc123".into(),
            chunk_size: 4,
            index,
            total: Some(3),
        }
    }

    #[test]
    fn test_encode_then_parse() {
        let frame = encode_chunk_frame(&header(2), b"\x00\x01\x02\xff").unwrap();
        let (parsed, body) = parse_chunk_frame(&frame).unwrap();

        assert_eq!(parsed.hash, "abc123");
        assert_eq!(parsed.index, 2);
        assert_eq!(parsed.total, Some(3));
        assert_eq!(body, b"\x00\x01\x02\xff");
    }

    #[test]
    fn test_empty_body_is_allowed() {
        let frame = encode_chunk_frame(&header(0), b"").unwrap();
        let (_, body) = parse_chunk_frame(&frame).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_string_fields_from_browser_clients() {
        let json = br#"{"hash":"abc123","chunkSize":"4","index":"1"}"#;
        let mut frame = (json.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(json);
        frame.extend_from_slice(b"body");

        let (parsed, body) = parse_chunk_frame(&frame).unwrap();
        assert_eq!(parsed.chunk_size, 4);
        assert_eq!(parsed.index, 1);
        assert_eq!(parsed.total, None);
        assert_eq!(body, b"body");
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(parse_chunk_frame(&[0, 0]), Err(FrameError::TooShort)));

        let truncated = [0, 0, 0, 10, b'{'];
        assert!(matches!(
            parse_chunk_frame(&truncated),
            Err(FrameError::HeaderTruncated { expected: 10, got: 1 })
        ));

        let huge = (MAX_HEADER_LEN as u32 + 1).to_be_bytes();
        assert!(matches!(parse_chunk_frame(&huge), Err(FrameError::HeaderTooLarge(_))));

        let mut bad_json = 3u32.to_be_bytes().to_vec();
        bad_json.extend_from_slice(b"{{{");
        assert!(matches!(parse_chunk_frame(&bad_json), Err(FrameError::InvalidJson(_))));
    }
}
