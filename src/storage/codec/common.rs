use crate::error::{VellumDBError, VellumDBResult};

/// Little-endian primitives shared by the page codecs. Each `decode_*`
/// returns the value and the number of bytes consumed.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(value: u8, buf: &mut Vec<u8>) {
        buf.push(value);
    }

    pub fn decode_u8(bytes: &[u8]) -> VellumDBResult<(u8, usize)> {
        let Some(value) = bytes.first() else {
            return Err(VellumDBError::Storage(
                "decode_u8: unexpected end of page".to_string(),
            ));
        };
        Ok((*value, 1))
    }

    pub fn encode_u32(value: u32, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn decode_u32(bytes: &[u8]) -> VellumDBResult<(u32, usize)> {
        if bytes.len() < 4 {
            return Err(VellumDBError::Storage(
                "decode_u32: unexpected end of page".to_string(),
            ));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        Ok((u32::from_le_bytes(raw), 4))
    }

    pub fn encode_bytes(value: &[u8], buf: &mut Vec<u8>) {
        buf.extend_from_slice(value);
    }

    pub fn decode_bytes(bytes: &[u8], len: usize) -> VellumDBResult<(Vec<u8>, usize)> {
        if bytes.len() < len {
            return Err(VellumDBError::Storage(
                "decode_bytes: unexpected end of page".to_string(),
            ));
        }
        Ok((bytes[..len].to_vec(), len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        let mut buf = Vec::new();
        CommonCodec::encode_u32(0xdead_beef, &mut buf);
        let (value, consumed) = CommonCodec::decode_u32(&buf).unwrap();
        assert_eq!(value, 0xdead_beef);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn truncated_input_errors() {
        assert!(CommonCodec::decode_u32(&[1, 2]).is_err());
        assert!(CommonCodec::decode_u8(&[]).is_err());
        assert!(CommonCodec::decode_bytes(&[1, 2, 3], 4).is_err());
    }
}
