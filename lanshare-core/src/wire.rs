//! Framing: magic (2 bytes LE) + payload length (4 bytes LE) + payload + length checksum (2 bytes LE).

use std::io;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Constant identifying a lanshare packet.
pub const MAGIC: u16 = 0x4C53;

const MAGIC_SIZE: usize = 2;
const LEN_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 2;

/// Magic plus length.
pub const HEADER_SIZE: usize = MAGIC_SIZE + LEN_SIZE;
/// Bytes a packet adds around its payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;
/// Largest payload a packet may carry. The length field is 4 bytes wide but only 16 bits are honoured.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Two-byte digest of the length field: the first two bytes of SHA-256 over its LE encoding.
pub fn length_checksum(len: u32) -> u16 {
    let digest = Sha256::digest(len.to_le_bytes());
    u16::from_le_bytes([digest[0], digest[1]])
}

/// Wrap `payload` into a packet. Output is always `FRAME_OVERHEAD + payload.len()` bytes.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&length_checksum(len).to_le_bytes());
    Ok(out)
}

/// Check magic and the length ceiling. Returns the declared payload length.
fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<usize, CodecError> {
    let magic = u16::from_le_bytes([header[0], header[1]]);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(len)
}

fn verify_checksum(len: usize, checksum: [u8; CHECKSUM_SIZE]) -> Result<(), CodecError> {
    if u16::from_le_bytes(checksum) != length_checksum(len as u32) {
        return Err(CodecError::ChecksumMismatch);
    }
    Ok(())
}

/// Decode one packet from the front of `bytes`. Returns the payload and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&bytes[..HEADER_SIZE]);
    let len = parse_header(&header)?;
    let total = FRAME_OVERHEAD + len;
    if bytes.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let tail = HEADER_SIZE + len;
    verify_checksum(len, [bytes[tail], bytes[tail + 1]])?;
    Ok((&bytes[HEADER_SIZE..tail], total))
}

/// Decode a packet and return an owned copy of its payload. Trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    decode_frame(bytes).map(|(payload, _)| payload.to_vec())
}

/// Read one packet from a stream. The header is validated before the payload buffer is sized,
/// so a hostile length can never allocate more than `MAX_PAYLOAD_LEN` bytes.
/// Codec failures come back as `InvalidData` wrapping the `CodecError`.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = parse_header(&header).map_err(invalid_data)?;
    let mut body = vec![0u8; len + CHECKSUM_SIZE];
    reader.read_exact(&mut body).await?;
    verify_checksum(len, [body[len], body[len + 1]]).map_err(invalid_data)?;
    body.truncate(len);
    Ok(body)
}

/// Frame `payload` and write it to a stream.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let frame = encode(payload).map_err(invalid_data)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_data(e: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Error framing or unframing a packet, or (de)serializing the message inside it.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),
    #[error("length checksum mismatch")]
    ChecksumMismatch,
    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}
