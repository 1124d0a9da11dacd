//! Wire protocol messages.
//!
//! Two surfaces share the length-prefixed framing from [`framing`]:
//!
//! - the **dispatch stream** (minion ⇄ master, TCP) carries a
//!   [`DispatchFrame`] protobuf envelope per frame;
//! - the **operator socket** (ctl ⇄ master, UDS) carries
//!   `[tag: u8][payload: protobuf]` frames routed by
//!   [`OperatorMessageType`]; response tag 0 is an [`OperatorError`].
//!
//! Messages are hand-rolled `prost` derives — the schema is small enough
//! that generated code would only add a build step.

pub mod framing;

use bytes::Bytes;
use prost::Message;

use crate::call::{Report, ReportItem};
use crate::error::{Error, ErrorKind, Result};
use crate::minion::{Minion, MinionKey, MinionState};

pub use framing::FrameCodec;

/// Frame discriminant on the dispatch stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    /// Stream-opening identity exchange.
    Connect = 0,
    /// An encrypted call request or response.
    Call = 1,
}

/// Minion identity record on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MinionRecord {
    /// Unique, minion-chosen name.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Master-issued stable identifier.
    #[prost(string, tag = "2")]
    pub uid: ::prost::alloc::string::String,
    /// Reported hostname.
    #[prost(string, tag = "3")]
    pub hostname: ::prost::alloc::string::String,
    /// Peer address.
    #[prost(string, tag = "4")]
    pub ip: ::prost::alloc::string::String,
    /// Operating system.
    #[prost(string, tag = "5")]
    pub os: ::prost::alloc::string::String,
    /// CPU architecture.
    #[prost(string, tag = "6")]
    pub arch: ::prost::alloc::string::String,
    /// Minion software version.
    #[prost(string, tag = "7")]
    pub version: ::prost::alloc::string::String,
    /// Free-form tags.
    #[prost(map = "string, string", tag = "8")]
    pub tags: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// First-contact time, Unix seconds.
    #[prost(int64, tag = "9")]
    pub registry_timestamp: i64,
    /// Last-attach time, Unix seconds.
    #[prost(int64, tag = "10")]
    pub online_timestamp: i64,
    /// Last-detach time, Unix seconds.
    #[prost(int64, tag = "11")]
    pub offline_timestamp: i64,
    /// Host groups the minion belongs to.
    #[prost(string, repeated, tag = "12")]
    pub groups: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

impl From<&Minion> for MinionRecord {
    fn from(m: &Minion) -> Self {
        Self {
            name: m.name.clone(),
            uid: m.uid.clone(),
            hostname: m.hostname.clone(),
            ip: m.ip.clone(),
            os: m.os.clone(),
            arch: m.arch.clone(),
            version: m.version.clone(),
            tags: m.tags.clone(),
            registry_timestamp: m.registry_timestamp,
            online_timestamp: m.online_timestamp,
            offline_timestamp: m.offline_timestamp,
            groups: m.groups.clone(),
        }
    }
}

impl From<MinionRecord> for Minion {
    fn from(m: MinionRecord) -> Self {
        Self {
            name: m.name,
            uid: m.uid,
            hostname: m.hostname,
            ip: m.ip,
            os: m.os,
            arch: m.arch,
            version: m.version,
            tags: m.tags,
            registry_timestamp: m.registry_timestamp,
            online_timestamp: m.online_timestamp,
            offline_timestamp: m.offline_timestamp,
            groups: m.groups,
        }
    }
}

/// First frame on a dispatch stream, minion → master.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    /// The minion's identity.
    #[prost(message, optional, tag = "1")]
    pub minion: ::core::option::Option<MinionRecord>,
    /// The minion's public key, PEM.
    #[prost(string, tag = "2")]
    pub public_key: ::prost::alloc::string::String,
    /// PKCS#1 v1.5/SHA-256 signature over [`connect_proof_bytes`],
    /// proving possession of the private half of `public_key`.
    #[prost(bytes = "vec", tag = "3")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

/// First reply on a dispatch stream, master → minion.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    /// Canonical identity: the master fills `ip` from the peer address
    /// when empty and issues `uid` on first contact.
    #[prost(message, optional, tag = "1")]
    pub minion: ::core::option::Option<MinionRecord>,
    /// The master's public key, PEM.
    #[prost(string, tag = "2")]
    pub master_public_key: ::prost::alloc::string::String,
    /// Non-empty when the attach was refused; `error_kind` carries the
    /// taxonomy string.
    #[prost(string, tag = "3")]
    pub error: ::prost::alloc::string::String,
    /// Wire form of the refusing [`ErrorKind`].
    #[prost(string, tag = "4")]
    pub error_kind: ::prost::alloc::string::String,
}

/// An encrypted call crossing the dispatch stream in either direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallFrame {
    /// Call id, in the clear for routing.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// RSA-encrypted MsgPack `CallRequest` (master→minion) or
    /// `CallResponse` (minion→master).
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// Non-empty on a reply when the minion could not decode or refused
    /// the call; the master records it as a `ResultError`.
    #[prost(string, tag = "3")]
    pub error: ::prost::alloc::string::String,
}

/// Envelope for every frame on the dispatch stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchFrame {
    /// Frame discriminant.
    #[prost(enumeration = "EventType", tag = "1")]
    pub event: i32,
    /// Set on minion→master `Connect`.
    #[prost(message, optional, tag = "2")]
    pub connect: ::core::option::Option<ConnectRequest>,
    /// Set on master→minion `Connect` replies.
    #[prost(message, optional, tag = "3")]
    pub connect_reply: ::core::option::Option<ConnectResponse>,
    /// Set on `Call` frames.
    #[prost(message, optional, tag = "4")]
    pub call: ::core::option::Option<CallFrame>,
}

impl DispatchFrame {
    /// Wraps a connect request.
    #[must_use]
    pub fn connect(request: ConnectRequest) -> Self {
        Self {
            event: EventType::Connect as i32,
            connect: Some(request),
            ..Self::default()
        }
    }

    /// Wraps a connect reply.
    #[must_use]
    pub fn connect_reply(reply: ConnectResponse) -> Self {
        Self {
            event: EventType::Connect as i32,
            connect_reply: Some(reply),
            ..Self::default()
        }
    }

    /// Wraps a call frame.
    #[must_use]
    pub fn call(call: CallFrame) -> Self {
        Self {
            event: EventType::Call as i32,
            call: Some(call),
            ..Self::default()
        }
    }

    /// The frame discriminant, tolerating unknown values as `Connect`.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        EventType::try_from(self.event).unwrap_or(EventType::Connect)
    }

    /// Encodes the envelope for framing.
    #[must_use]
    pub fn encode_frame(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Decodes an envelope from one frame payload.
    ///
    /// # Errors
    ///
    /// Returns `internal` on malformed protobuf.
    pub fn decode_frame(data: &[u8]) -> Result<Self> {
        Ok(Self::decode(data)?)
    }
}

/// Canonical bytes the connect signature covers.
///
/// Both sides must derive the identical byte string: the minion signs it
/// with its private key and the master verifies against the public key
/// presented in the same request.
#[must_use]
pub fn connect_proof_bytes(record: &MinionRecord, public_key_pem: &str) -> Vec<u8> {
    format!(
        "{}\n{}\n{}\n{}",
        record.name, record.uid, record.hostname, public_key_pem
    )
    .into_bytes()
}

// ============================================================================
// Operator socket messages
// ============================================================================

/// Message type tags routing operator-socket frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatorMessageType {
    /// Liveness probe.
    Ping = 1,
    /// Per-state name listing.
    ListMinions = 2,
    /// Single key record fetch.
    GetMinion = 3,
    /// Accept transition.
    AcceptMinion = 4,
    /// Reject transition.
    RejectMinion = 5,
    /// Record deletion.
    DeleteMinion = 6,
    /// Bulk key record fetch.
    PrintMinion = 7,
    /// Command dispatch.
    Call = 8,
}

impl OperatorMessageType {
    /// Parses a tag byte.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Ping),
            2 => Some(Self::ListMinions),
            3 => Some(Self::GetMinion),
            4 => Some(Self::AcceptMinion),
            5 => Some(Self::RejectMinion),
            6 => Some(Self::DeleteMinion),
            7 => Some(Self::PrintMinion),
            8 => Some(Self::Call),
            _ => None,
        }
    }

    /// The tag byte for this message type.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Error payload on the operator socket (response tag 0).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperatorError {
    /// Wire form of the [`ErrorKind`].
    #[prost(string, tag = "1")]
    pub kind: ::prost::alloc::string::String,
    /// Human-readable detail.
    #[prost(string, tag = "2")]
    pub detail: ::prost::alloc::string::String,
}

impl From<&Error> for OperatorError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            detail: err.detail.clone(),
        }
    }
}

impl From<OperatorError> for Error {
    fn from(err: OperatorError) -> Self {
        Self::new(ErrorKind::from_str_lossy(&err.kind), err.detail)
    }
}

/// Liveness probe.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PingRequest {}

/// Liveness reply.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PingResponse {}

/// Lists minion names per trust state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMinionsRequest {
    /// States to list; empty means all five.
    #[prost(string, repeated, tag = "1")]
    pub states: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Per-state name listing.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMinionsResponse {
    /// Names awaiting approval.
    #[prost(string, repeated, tag = "1")]
    pub unaccepted: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Explicitly approved names.
    #[prost(string, repeated, tag = "2")]
    pub accepted: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Auto-approved names.
    #[prost(string, repeated, tag = "3")]
    pub auto_sign: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Auto-rejected names.
    #[prost(string, repeated, tag = "4")]
    pub denied: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Operator-rejected names.
    #[prost(string, repeated, tag = "5")]
    pub rejected: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Fetches one key record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMinionRequest {
    /// Minion name.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
}

/// Identity + public key + state, the operator-facing key record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MinionKeyMsg {
    /// The identity record.
    #[prost(message, optional, tag = "1")]
    pub minion: ::core::option::Option<MinionRecord>,
    /// The minion's public key, PEM.
    #[prost(string, tag = "2")]
    pub public_key: ::prost::alloc::string::String,
    /// Canonical state string.
    #[prost(string, tag = "3")]
    pub state: ::prost::alloc::string::String,
}

impl From<&MinionKey> for MinionKeyMsg {
    fn from(key: &MinionKey) -> Self {
        Self {
            minion: Some(MinionRecord::from(&key.minion)),
            public_key: key.public_key.clone(),
            state: key.state.as_str().to_string(),
        }
    }
}

impl TryFrom<MinionKeyMsg> for MinionKey {
    type Error = Error;

    fn try_from(msg: MinionKeyMsg) -> Result<Self> {
        let minion = msg
            .minion
            .ok_or_else(|| Error::internal("key record without identity"))?;
        Ok(Self {
            minion: minion.into(),
            public_key: msg.public_key,
            state: msg.state.parse::<MinionState>()?,
        })
    }
}

/// Single key record reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMinionResponse {
    /// The key record.
    #[prost(message, optional, tag = "1")]
    pub key: ::core::option::Option<MinionKeyMsg>,
}

/// Accept transition request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcceptMinionRequest {
    /// Names to accept; ignored when `all` is set.
    #[prost(string, repeated, tag = "1")]
    pub names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Accept every unaccepted minion.
    #[prost(bool, tag = "2")]
    pub all: bool,
    /// Also pull names out of the rejected bucket.
    #[prost(bool, tag = "3")]
    pub include_rejected: bool,
    /// Also pull names out of the denied bucket.
    #[prost(bool, tag = "4")]
    pub include_denied: bool,
}

/// Accept transition reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcceptMinionResponse {
    /// Names actually transitioned.
    #[prost(string, repeated, tag = "1")]
    pub accepted: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Reject transition request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RejectMinionRequest {
    /// Names to reject; ignored when `all` is set.
    #[prost(string, repeated, tag = "1")]
    pub names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Reject every unaccepted minion.
    #[prost(bool, tag = "2")]
    pub all: bool,
    /// Also pull names out of the accepted/auto-sign buckets.
    #[prost(bool, tag = "3")]
    pub include_accepted: bool,
    /// Also pull names out of the denied bucket.
    #[prost(bool, tag = "4")]
    pub include_denied: bool,
}

/// Reject transition reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RejectMinionResponse {
    /// Names actually transitioned.
    #[prost(string, repeated, tag = "1")]
    pub rejected: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Deletion request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMinionRequest {
    /// Names to delete; ignored when `all` is set.
    #[prost(string, repeated, tag = "1")]
    pub names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Delete every known minion.
    #[prost(bool, tag = "2")]
    pub all: bool,
}

/// Deletion reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMinionResponse {
    /// Names actually deleted.
    #[prost(string, repeated, tag = "1")]
    pub deleted: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Bulk key record request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrintMinionRequest {
    /// Names to print; ignored when `all` is set.
    #[prost(string, repeated, tag = "1")]
    pub names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Print every known minion.
    #[prost(bool, tag = "2")]
    pub all: bool,
}

/// Bulk key record reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrintMinionResponse {
    /// The key records.
    #[prost(message, repeated, tag = "1")]
    pub keys: ::prost::alloc::vec::Vec<MinionKeyMsg>,
}

/// Command dispatch request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallCommandRequest {
    /// Function (command) name.
    #[prost(string, tag = "1")]
    pub function: ::prost::alloc::string::String,
    /// Positional arguments.
    #[prost(string, repeated, tag = "2")]
    pub args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Deadline in seconds; ≤ 0 means the default.
    #[prost(int64, tag = "3")]
    pub timeout: i64,
    /// Selection expression text.
    #[prost(string, tag = "4")]
    pub selection: ::prost::alloc::string::String,
}

/// One minion's row in a wire report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportItemMsg {
    /// Minion name.
    #[prost(string, tag = "1")]
    pub minion: ::prost::alloc::string::String,
    /// True when the call completed successfully.
    #[prost(bool, tag = "2")]
    pub result: bool,
    /// Raw command output.
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// Error explanation.
    #[prost(string, tag = "4")]
    pub error: ::prost::alloc::string::String,
}

/// Aggregated call report on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportMsg {
    /// Per-minion rows in selection order.
    #[prost(message, repeated, tag = "1")]
    pub items: ::prost::alloc::vec::Vec<ReportItemMsg>,
    /// Number of live targets dispatched to.
    #[prost(uint32, tag = "2")]
    pub total: u32,
}

impl From<&Report> for ReportMsg {
    fn from(report: &Report) -> Self {
        Self {
            items: report
                .items
                .iter()
                .map(|item| ReportItemMsg {
                    minion: item.minion.clone(),
                    result: item.result,
                    data: item.data.clone(),
                    error: item.error.clone(),
                })
                .collect(),
            total: report.total,
        }
    }
}

impl From<ReportMsg> for Report {
    fn from(msg: ReportMsg) -> Self {
        Self {
            items: msg
                .items
                .into_iter()
                .map(|item| ReportItem {
                    minion: item.minion,
                    result: item.result,
                    data: item.data,
                    error: item.error,
                })
                .collect(),
            total: msg.total,
        }
    }
}

/// Command dispatch reply.
///
/// A deadline that fires mid-call still returns the partially-filled
/// report; `error`/`error_kind` carry the deadline (or other call-level)
/// failure alongside it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallCommandResponse {
    /// The aggregated report.
    #[prost(message, optional, tag = "1")]
    pub report: ::core::option::Option<ReportMsg>,
    /// Call-level failure detail, empty on success.
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
    /// Wire form of the failing [`ErrorKind`], empty on success.
    #[prost(string, tag = "3")]
    pub error_kind: ::prost::alloc::string::String,
}

/// A decoded operator-socket request.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorRequest {
    /// Liveness probe.
    Ping(PingRequest),
    /// Per-state listing.
    ListMinions(ListMinionsRequest),
    /// Single record fetch.
    GetMinion(GetMinionRequest),
    /// Accept transition.
    AcceptMinion(AcceptMinionRequest),
    /// Reject transition.
    RejectMinion(RejectMinionRequest),
    /// Deletion.
    DeleteMinion(DeleteMinionRequest),
    /// Bulk record fetch.
    PrintMinion(PrintMinionRequest),
    /// Command dispatch.
    Call(CallCommandRequest),
}

impl OperatorRequest {
    /// Encodes as `[tag][protobuf]`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        fn enc(tag: OperatorMessageType, msg: &impl Message) -> Bytes {
            let mut buf = vec![tag.tag()];
            msg.encode(&mut buf).expect("vec write cannot fail");
            Bytes::from(buf)
        }
        match self {
            Self::Ping(m) => enc(OperatorMessageType::Ping, m),
            Self::ListMinions(m) => enc(OperatorMessageType::ListMinions, m),
            Self::GetMinion(m) => enc(OperatorMessageType::GetMinion, m),
            Self::AcceptMinion(m) => enc(OperatorMessageType::AcceptMinion, m),
            Self::RejectMinion(m) => enc(OperatorMessageType::RejectMinion, m),
            Self::DeleteMinion(m) => enc(OperatorMessageType::DeleteMinion, m),
            Self::PrintMinion(m) => enc(OperatorMessageType::PrintMinion, m),
            Self::Call(m) => enc(OperatorMessageType::Call, m),
        }
    }

    /// Decodes a `[tag][protobuf]` frame.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` on an empty frame or unknown tag and
    /// `internal` on malformed protobuf.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&tag, payload) = frame
            .split_first()
            .ok_or_else(|| Error::bad_request("empty operator frame"))?;
        let msg_type = OperatorMessageType::from_tag(tag)
            .ok_or_else(|| Error::bad_request(format!("unknown operator message tag {tag}")))?;
        Ok(match msg_type {
            OperatorMessageType::Ping => Self::Ping(PingRequest::decode(payload)?),
            OperatorMessageType::ListMinions => {
                Self::ListMinions(ListMinionsRequest::decode(payload)?)
            }
            OperatorMessageType::GetMinion => Self::GetMinion(GetMinionRequest::decode(payload)?),
            OperatorMessageType::AcceptMinion => {
                Self::AcceptMinion(AcceptMinionRequest::decode(payload)?)
            }
            OperatorMessageType::RejectMinion => {
                Self::RejectMinion(RejectMinionRequest::decode(payload)?)
            }
            OperatorMessageType::DeleteMinion => {
                Self::DeleteMinion(DeleteMinionRequest::decode(payload)?)
            }
            OperatorMessageType::PrintMinion => {
                Self::PrintMinion(PrintMinionRequest::decode(payload)?)
            }
            OperatorMessageType::Call => Self::Call(CallCommandRequest::decode(payload)?),
        })
    }
}

/// An operator-socket response envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorResponse {
    /// Liveness reply.
    Ping(PingResponse),
    /// Per-state listing.
    ListMinions(ListMinionsResponse),
    /// Single record.
    GetMinion(GetMinionResponse),
    /// Accepted names.
    AcceptMinion(AcceptMinionResponse),
    /// Rejected names.
    RejectMinion(RejectMinionResponse),
    /// Deleted names.
    DeleteMinion(DeleteMinionResponse),
    /// Bulk records.
    PrintMinion(PrintMinionResponse),
    /// Call report.
    Call(CallCommandResponse),
    /// Failure, tag 0 on the wire.
    Error(OperatorError),
}

impl OperatorResponse {
    /// Wraps a fabric error for the wire.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self::Error(OperatorError::from(err))
    }

    /// Encodes as `[tag][protobuf]`, echoing the request tag (0 for
    /// errors).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        fn enc(tag: u8, msg: &impl Message) -> Bytes {
            let mut buf = vec![tag];
            msg.encode(&mut buf).expect("vec write cannot fail");
            Bytes::from(buf)
        }
        match self {
            Self::Ping(m) => enc(OperatorMessageType::Ping.tag(), m),
            Self::ListMinions(m) => enc(OperatorMessageType::ListMinions.tag(), m),
            Self::GetMinion(m) => enc(OperatorMessageType::GetMinion.tag(), m),
            Self::AcceptMinion(m) => enc(OperatorMessageType::AcceptMinion.tag(), m),
            Self::RejectMinion(m) => enc(OperatorMessageType::RejectMinion.tag(), m),
            Self::DeleteMinion(m) => enc(OperatorMessageType::DeleteMinion.tag(), m),
            Self::PrintMinion(m) => enc(OperatorMessageType::PrintMinion.tag(), m),
            Self::Call(m) => enc(OperatorMessageType::Call.tag(), m),
            Self::Error(m) => enc(0, m),
        }
    }

    /// Decodes a response frame.
    ///
    /// # Errors
    ///
    /// Returns `internal` on an empty frame, unknown tag, or malformed
    /// protobuf.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&tag, payload) = frame
            .split_first()
            .ok_or_else(|| Error::internal("empty operator response frame"))?;
        if tag == 0 {
            return Ok(Self::Error(OperatorError::decode(payload)?));
        }
        let msg_type = OperatorMessageType::from_tag(tag)
            .ok_or_else(|| Error::internal(format!("unknown operator response tag {tag}")))?;
        Ok(match msg_type {
            OperatorMessageType::Ping => Self::Ping(PingResponse::decode(payload)?),
            OperatorMessageType::ListMinions => {
                Self::ListMinions(ListMinionsResponse::decode(payload)?)
            }
            OperatorMessageType::GetMinion => Self::GetMinion(GetMinionResponse::decode(payload)?),
            OperatorMessageType::AcceptMinion => {
                Self::AcceptMinion(AcceptMinionResponse::decode(payload)?)
            }
            OperatorMessageType::RejectMinion => {
                Self::RejectMinion(RejectMinionResponse::decode(payload)?)
            }
            OperatorMessageType::DeleteMinion => {
                Self::DeleteMinion(DeleteMinionResponse::decode(payload)?)
            }
            OperatorMessageType::PrintMinion => {
                Self::PrintMinion(PrintMinionResponse::decode(payload)?)
            }
            OperatorMessageType::Call => Self::Call(CallCommandResponse::decode(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_frame_round_trip() {
        let frame = DispatchFrame::call(CallFrame {
            id: 7,
            data: vec![1, 2, 3],
            error: String::new(),
        });
        let bytes = frame.encode_frame();
        let back = DispatchFrame::decode_frame(&bytes).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.event_type(), EventType::Call);
    }

    #[test]
    fn operator_request_round_trip() {
        let req = OperatorRequest::AcceptMinion(AcceptMinionRequest {
            names: vec!["m1".to_string()],
            all: false,
            include_rejected: true,
            include_denied: false,
        });
        let bytes = req.encode();
        assert_eq!(bytes[0], OperatorMessageType::AcceptMinion.tag());
        assert_eq!(OperatorRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn operator_error_uses_tag_zero() {
        let rsp = OperatorResponse::from_error(&Error::conflict("minion m1 already attached"));
        let bytes = rsp.encode();
        assert_eq!(bytes[0], 0);
        match OperatorResponse::decode(&bytes).unwrap() {
            OperatorResponse::Error(err) => {
                let err: Error = err.into();
                assert!(err.is_conflict());
                assert_eq!(err.detail, "minion m1 already attached");
            }
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(OperatorRequest::decode(&[0x7f, 0, 0]).is_err());
        assert!(OperatorRequest::decode(&[]).is_err());
    }

    #[test]
    fn minion_record_conversion_round_trip() {
        let minion = Minion {
            name: "m1".to_string(),
            uid: "u-9".to_string(),
            os: "linux".to_string(),
            registry_timestamp: 123,
            ..Minion::default()
        };
        let record = MinionRecord::from(&minion);
        let back: Minion = record.into();
        assert_eq!(back, minion);
    }

    #[test]
    fn proof_bytes_are_stable() {
        let record = MinionRecord {
            name: "m1".to_string(),
            uid: "u".to_string(),
            hostname: "h".to_string(),
            ..MinionRecord::default()
        };
        assert_eq!(connect_proof_bytes(&record, "PEM"), b"m1\nu\nh\nPEM");
    }
}
