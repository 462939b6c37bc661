//! Connect streaming envelopes: `flags:u8 | len:u32be | payload`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tonic::Status;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x02;

const HEADER_LEN: usize = 5;

pub fn encode(flags: u8, payload: &[u8]) -> Result<Bytes, Status> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Status::resource_exhausted("message exceeds envelope size limit"))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split the single request message out of a server-streaming request body
pub fn decode_single(mut body: Bytes) -> Result<Bytes, Status> {
    if body.len() < HEADER_LEN {
        return Err(Status::invalid_argument("request envelope is truncated"));
    }

    let flags = body.get_u8();
    let len = body.get_u32() as usize;

    if flags & FLAG_COMPRESSED != 0 {
        return Err(Status::unimplemented("compressed messages are not supported"));
    }
    if flags & FLAG_END_STREAM != 0 {
        return Err(Status::invalid_argument("unexpected end-of-stream envelope in request"));
    }
    if body.len() != len {
        return Err(Status::invalid_argument(format!(
            "request envelope declares {len} bytes but carries {}",
            body.len()
        )));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(FLAG_END_STREAM, b"{}").unwrap();
        assert_eq!(&frame[..], &[0x02, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_decode_single() {
        let frame = encode(0, b"{\"symbol\":\"AAPL\"}").unwrap();
        assert_eq!(&decode_single(frame).unwrap()[..], b"{\"symbol\":\"AAPL\"}");
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(decode_single(Bytes::from_static(&[0, 0])).is_err());

        let short = Bytes::from_static(&[0, 0, 0, 0, 9, b'x']);
        assert_eq!(decode_single(short).unwrap_err().code(), tonic::Code::InvalidArgument);

        let compressed = encode(FLAG_COMPRESSED, b"x").unwrap();
        assert_eq!(decode_single(compressed).unwrap_err().code(), tonic::Code::Unimplemented);
    }
}
