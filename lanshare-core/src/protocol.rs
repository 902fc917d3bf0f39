//! lanshare wire protocol: message types and compatibility number.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transfer::{FileId, TransferState};
use crate::wire::{self, CodecError, FRAME_OVERHEAD, MAX_PAYLOAD_LEN};

/// Wire compatibility number. Peers announcing a different value are ignored.
pub const COMPATIBILITY: u32 = 1;

/// Largest slice of file data carried by one `FileChunk`. Leaves room for the
/// chunk header and bincode overhead inside `MAX_PAYLOAD_LEN`.
pub const CHUNK_SIZE: usize = 60 * 1024;

const _: () = assert!(CHUNK_SIZE + FRAME_OVERHEAD + 64 <= MAX_PAYLOAD_LEN);

/// All wire message types. Encoding is bincode; framing is the packet codec (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence and the data-service port.
    DiscoveryAnnounce {
        compatibility: u32,
        group: u8,
        instance_id: Uuid,
        host_name: String,
        data_port: u16,
        /// Port the announcer listens on for discovery; direct replies go there.
        discovery_port: u16,
        /// Ask receivers to answer directly instead of waiting for their next broadcast.
        need_response: bool,
    },
    /// Short text message.
    Text { text: String },
    /// Proposal to send a file. No data follows until a `FileResponse` accepts it.
    FileOffer {
        file_id: FileId,
        size: u64,
        name: String,
    },
    /// Receiver's decision on an offer.
    FileResponse {
        file_id: FileId,
        size: u64,
        accepted: bool,
    },
    /// One slice of file data at `offset`.
    FileChunk {
        file_id: FileId,
        offset: u64,
        data: Vec<u8>,
    },
    /// Progress or terminal status of a transfer, sent by either side.
    FileStatus {
        file_id: FileId,
        transferred: u64,
        total: u64,
        state: TransferState,
    },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::DiscoveryAnnounce { .. } => "discovery_announce",
            Message::Text { .. } => "text",
            Message::FileOffer { .. } => "file_offer",
            Message::FileResponse { .. } => "file_response",
            Message::FileChunk { .. } => "file_chunk",
            Message::FileStatus { .. } => "file_status",
        }
    }

    /// Serialize into a packet payload (no framing).
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    /// Parse a packet payload (no framing).
    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(payload).map_err(CodecError::Decode)
    }

    /// Serialize and frame into a complete packet.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        wire::encode(&self.to_payload()?)
    }

    /// Unframe and parse a complete packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (payload, _) = wire::decode_frame(bytes)?;
        Self::from_payload(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_announce() -> Message {
        Message::DiscoveryAnnounce {
            compatibility: COMPATIBILITY,
            group: 7,
            instance_id: Uuid::new_v4(),
            host_name: "desk".into(),
            data_port: 9819,
            discovery_port: 9818,
            need_response: true,
        }
    }

    #[test]
    fn roundtrip_announce() {
        let msg = sample_announce();
        let frame = msg.encode().unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn roundtrip_full_chunk() {
        let msg = Message::FileChunk {
            file_id: 3,
            offset: 4 * CHUNK_SIZE as u64,
            data: vec![0x5A; CHUNK_SIZE],
        };
        let frame = msg.encode().unwrap();
        assert!(frame.len() <= MAX_PAYLOAD_LEN + FRAME_OVERHEAD);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn oversized_text_rejected() {
        let msg = Message::Text {
            text: "x".repeat(MAX_PAYLOAD_LEN),
        };
        assert!(matches!(
            msg.encode(),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_variant_rejected() {
        let frame = wire::encode(&[0xFF, 0, 0, 0]).unwrap();
        assert!(matches!(Message::decode(&frame), Err(CodecError::Decode(_))));
    }

    #[test]
    fn status_carries_state() {
        let msg = Message::FileStatus {
            file_id: 9,
            transferred: 10,
            total: 20,
            state: TransferState::Cancelled,
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded,
            Message::FileStatus {
                state: TransferState::Cancelled,
                ..
            }
        ));
    }
}
