//! # Wire Protocol Messages
//!
//! A single envelope type covers every DHT exchange. Requests and responses
//! share the shape; `response` marks direction and `id` correlates the pair.
//! Messages are serialized with bincode under a size limit so a peer cannot
//! make us allocate an unbounded buffer.
//!
//! | Kind | Request carries | Response carries |
//! |------|-----------------|------------------|
//! | `Ping` | id | id |
//! | `FindNode` | key = peer id | peers, success = exact match |
//! | `GetValue` | key | value on hit, peers on miss |
//! | `PutValue` | key, value | (none, fire-and-forget) |
//! | `AddProvider` | key | (none) |
//! | `GetProviders` | key | peers |
//! | `Diagnostic` | id | value = serialized [`DiagInfo`] list |
//!
//! Message ids are 32-bit uniformly random values widened to 64 bits. A
//! collision makes a late response look unsolicited, which the router
//! already tolerates.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::PeerId;

/// Maximum size of a value carried in an envelope (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, value plus envelope overhead.
pub const MAX_ENVELOPE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Operation selector for the wire envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Ping,
    FindNode,
    GetValue,
    PutValue,
    AddProvider,
    GetProviders,
    Diagnostic,
}

/// Peer reference carried inside responses: identity plus one dialable
/// address in multiaddr text form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: String,
}

/// The one wire message. Fields not meaningful for a given kind stay empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub id: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub response: bool,
    pub success: bool,
    pub peers: Vec<PeerInfo>,
}

impl Envelope {
    /// Fresh request with a random message id.
    pub fn request(kind: MessageKind) -> Self {
        Self {
            kind,
            id: generate_message_id(),
            key: Vec::new(),
            value: Vec::new(),
            response: false,
            success: false,
            peers: Vec::new(),
        }
    }

    /// Response skeleton echoing the request's kind and id.
    pub fn reply_to(request: &Envelope) -> Self {
        Self {
            kind: request.kind,
            id: request.id,
            key: Vec::new(),
            value: Vec::new(),
            response: true,
            success: false,
            peers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }
}

/// Generate a message id: random u32 widened to u64.
pub fn generate_message_id() -> u64 {
    rand::random::<u32>() as u64
}

/// One node's contribution to a DIAGNOSTIC sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagInfo {
    pub id: PeerId,
    pub addresses: Vec<String>,
    pub table_size: usize,
    pub uptime_secs: u64,
    pub keys_stored: usize,
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_ENVELOPE_SIZE)
        .with_fixint_encoding()
}

/// Serialize an envelope (or any wire-facing type) to bytes.
pub fn marshal<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the size limit enforced. Use this for every byte buffer
/// that came off the network.
pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer_info(seed: u8) -> PeerInfo {
        PeerInfo {
            id: PeerId::from_bytes(vec![seed; 6]),
            addr: format!("/ip4/127.0.0.1/tcp/{}", 4000 + seed as u16),
        }
    }

    #[test]
    fn envelope_round_trip_all_kinds() {
        let kinds = [
            MessageKind::Ping,
            MessageKind::FindNode,
            MessageKind::GetValue,
            MessageKind::PutValue,
            MessageKind::AddProvider,
            MessageKind::GetProviders,
            MessageKind::Diagnostic,
        ];

        for kind in kinds {
            let env = Envelope {
                key: b"some-key".to_vec(),
                value: b"some-value".to_vec(),
                success: true,
                peers: vec![sample_peer_info(1), sample_peer_info(2)],
                ..Envelope::request(kind)
            };
            let bytes = marshal(&env).unwrap();
            let decoded: Envelope = unmarshal(&bytes).unwrap();
            assert_eq!(env, decoded);
        }
    }

    #[test]
    fn reply_preserves_id_and_kind() {
        let req = Envelope::request(MessageKind::GetValue).with_key(b"k".as_slice());
        let resp = Envelope::reply_to(&req);
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.kind, req.kind);
        assert!(resp.response);
    }

    #[test]
    fn message_id_fits_in_u32() {
        for _ in 0..1000 {
            assert!(generate_message_id() <= u32::MAX as u64);
        }
    }

    #[test]
    fn malformed_bytes_rejected() {
        let garbage = [0xFFu8, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(unmarshal::<Envelope>(&garbage).is_err());

        let env = Envelope::request(MessageKind::Ping);
        let bytes = marshal(&env).unwrap();
        assert!(unmarshal::<Envelope>(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn diag_info_list_round_trip() {
        let infos = vec![
            DiagInfo {
                id: PeerId::from_bytes(vec![1, 2, 3]),
                addresses: vec!["/ip4/127.0.0.1/tcp/5000".into()],
                table_size: 4,
                uptime_secs: 17,
                keys_stored: 2,
            },
            DiagInfo {
                id: PeerId::from_bytes(vec![4, 5, 6]),
                addresses: vec![],
                table_size: 0,
                uptime_secs: 0,
                keys_stored: 0,
            },
        ];
        let bytes = marshal(&infos).unwrap();
        let decoded: Vec<DiagInfo> = unmarshal(&bytes).unwrap();
        assert_eq!(infos, decoded);
    }
}
