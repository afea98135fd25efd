//! The length-prefixed wire envelope and the logical frame variants
//! traded between endpoints: a small, explicit, `serde`-derived tagged
//! union rather than a protobuf schema, since only tag stability within
//! a deployment is required, not cross-language wire compatibility.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::medium::MediumTag;

/// Maximum allowed frame body length on the wire, per the invariant in
/// the data model: any other value is a fatal protocol error.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Validates a length prefix read off the wire.
pub fn validate_frame_len(n: i32) -> Result<usize> {
    if n < 0 || n as usize > MAX_FRAME_LEN {
        return Err(Error::wrapped(
            ErrorKind::EndpointIoError,
            format!("frame length {} outside [0, {}]", n, MAX_FRAME_LEN),
        ));
    }
    Ok(n as usize)
}

/// A logical frame, independent of whether it travelled in the clear or
/// was decrypted from ciphertext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    KeepAlive { ack: bool },
    Disconnection,
    BwuNegotiation(BwuNegotiation),
    /// Opaque to this crate; passed through to the payload layer.
    PayloadTransfer(Vec<u8>),
}

/// Discriminant used to register and dispatch `FrameProcessor`s without
/// matching on the full `Frame` payload.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum FrameType {
    ConnectionRequest,
    ConnectionResponse,
    KeepAlive,
    Disconnection,
    BwuNegotiation,
    PayloadTransfer,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectionRequest(_) => FrameType::ConnectionRequest,
            Frame::ConnectionResponse(_) => FrameType::ConnectionResponse,
            Frame::KeepAlive { .. } => FrameType::KeepAlive,
            Frame::Disconnection => FrameType::Disconnection,
            Frame::BwuNegotiation(_) => FrameType::BwuNegotiation,
            Frame::PayloadTransfer(_) => FrameType::PayloadTransfer,
        }
    }

    /// True for a well-formed `KEEP_ALIVE`, used by the stray-plaintext
    /// fallback on encrypted channels.
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Frame::KeepAlive { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub endpoint_id: String,
    pub endpoint_info: Vec<u8>,
    pub nonce: i32,
    pub supported_mediums: Vec<MediumTag>,
    pub keep_alive_interval_ms: i32,
    pub keep_alive_timeout_ms: i32,
}

/// `UNKNOWN`/`ACCEPT`/`REJECT`, mirroring the legacy three-state field.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ResponseKind {
    Unknown,
    Accept,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub status: i32,
    pub response: ResponseKind,
}

impl ConnectionResponse {
    pub const STATUS_SUCCESS: i32 = 0;

    pub fn accept() -> Self {
        ConnectionResponse { status: Self::STATUS_SUCCESS, response: ResponseKind::Accept }
    }

    pub fn reject() -> Self {
        ConnectionResponse { status: 1, response: ResponseKind::Reject }
    }

    /// Canonical accept decision for this crate: `response == ACCEPT` is
    /// authoritative; a legacy peer with `response == UNKNOWN` is
    /// treated as accepting iff `status == kSuccess`, for backward
    /// compatibility only. New peers should always set `response`
    /// explicitly.
    pub fn is_accept(&self) -> bool {
        match self.response {
            ResponseKind::Accept => true,
            ResponseKind::Reject => false,
            ResponseKind::Unknown => self.status == Self::STATUS_SUCCESS,
        }
    }
}

/// BWU_NEGOTIATION sub-messages, all travelling on the *current* channel
/// for a given endpoint during a bandwidth upgrade.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BwuNegotiation {
    PathAvailable {
        medium: MediumTag,
        service_id: String,
        credentials: Vec<u8>,
    },
    AvailableMediumsDiscovery {
        mediums: Vec<MediumTag>,
    },
    ClientIntroduction {
        endpoint_id: String,
    },
    ClientIntroductionAck,
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
    UpgradeFailure {
        reason: String,
    },
}

/// Serializes a logical frame to its wire body (pre-encryption).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    bincode::serialize(frame).wrapped_invalid()
}

/// Deserializes a wire body (post-decryption) into a logical frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    bincode::deserialize(bytes).wrapped_invalid()
}

trait BincodeResultExt<T> {
    fn wrapped_invalid(self) -> Result<T>;
}

impl<T> BincodeResultExt<T> for std::result::Result<T, bincode::Error> {
    fn wrapped_invalid(self) -> Result<T> {
        self.map_err(|e| Error::wrapped(ErrorKind::InvalidProtocolBuffer, e))
    }
}
