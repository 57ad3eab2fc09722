//! Datagram format
//!
//! One bincode-encoded [`Packet`] per UDP datagram. A sender opens a
//! session with `Hello` and is acknowledged with `Welcome`; audio follows
//! with a per-session sequence number so the receiver can count gaps.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NetworkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Hello {
        session: Uuid,
    },
    Welcome {
        session: Uuid,
    },
    Audio {
        session: Uuid,
        sequence: u32,
        samples: Vec<i16>,
    },
    Bye {
        session: Uuid,
    },
}

impl Packet {
    pub fn session(&self) -> Uuid {
        match self {
            Packet::Hello { session }
            | Packet::Welcome { session }
            | Packet::Audio { session, .. }
            | Packet::Bye { session } => *session,
        }
    }

    /// Encode into `buf`, replacing its contents
    pub fn encode_into(&self, buf: &mut BytesMut, max_size: usize) -> Result<(), NetworkError> {
        let size = bincode::serialized_size(self).map_err(|e| NetworkError::SendFailed(e.to_string()))?
            as usize;
        if size > max_size {
            return Err(NetworkError::PacketTooLarge(size));
        }
        buf.clear();
        buf.reserve(size);
        bincode::serialize_into((&mut *buf).writer(), self).map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Packet, NetworkError> {
        bincode::deserialize(data).map_err(|_| NetworkError::InvalidPacket)
    }
}

/// Encoded size of an audio packet with no samples
pub fn audio_overhead() -> usize {
    let empty = Packet::Audio {
        session: Uuid::nil(),
        sequence: 0,
        samples: Vec::new(),
    };
    bincode::serialized_size(&empty).map_or(0, |n| n as usize)
}

/// Most samples one audio datagram of `max_packet_size` bytes can carry
pub fn max_samples_per_packet(max_packet_size: usize) -> usize {
    max_packet_size.saturating_sub(audio_overhead()) / std::mem::size_of::<i16>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_PACKET_SIZE;

    #[test]
    fn test_full_audio_packet_fits_datagram() {
        let max = max_samples_per_packet(MAX_PACKET_SIZE);
        assert!(max > 600);

        let packet = Packet::Audio {
            session: Uuid::new_v4(),
            sequence: 42,
            samples: vec![-1; max],
        };
        let mut buf = BytesMut::new();
        packet.encode_into(&mut buf, MAX_PACKET_SIZE).unwrap();
        assert!(buf.len() <= MAX_PACKET_SIZE);
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let packet = Packet::Audio {
            session: Uuid::new_v4(),
            sequence: 0,
            samples: vec![0; MAX_PACKET_SIZE],
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            packet.encode_into(&mut buf, MAX_PACKET_SIZE),
            Err(NetworkError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(
            Packet::decode(&[0xff, 0xff, 0xff, 0xff, 1, 2]),
            Err(NetworkError::InvalidPacket)
        ));
        assert!(matches!(Packet::decode(&[]), Err(NetworkError::InvalidPacket)));
    }

    #[test]
    fn test_session_accessor() {
        let session = Uuid::new_v4();
        assert_eq!(Packet::Bye { session }.session(), session);
    }
}
