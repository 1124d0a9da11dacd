//! Logical call payloads and the per-call report.
//!
//! A [`CallRequest`] travels master→minion and a [`CallResponse`] travels
//! back, both MsgPack-encoded and RSA-encrypted under the peer's public
//! key. The [`Report`] is the master-side aggregate returned to the
//! operator.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::select::SelectionOptions;

/// Outcome discriminant of a single minion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    /// The minion's own refinement decided the call did not target it.
    #[default]
    Skip,
    /// The command ran; `ret_code` and `result` are meaningful.
    Ok,
    /// Decrypt/decode failure or the command itself failed.
    Error,
}

/// A function call dispatched to a selected set of minions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Call id, unique within the master process lifetime.
    pub id: u64,
    /// Function (command) name.
    pub function: String,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Deadline in seconds. Values ≤ 0 mean "unset": the master stamps
    /// its configured default before fan-out, and
    /// [`effective_timeout`](Self::effective_timeout) supplies the
    /// built-in 10 s fallback everywhere else.
    pub timeout: i64,
    /// Target-selection expression.
    pub options: SelectionOptions,
}

impl CallRequest {
    /// Timeout in seconds with the built-in 10 s fallback applied to
    /// unset (≤ 0) values.
    #[must_use]
    pub const fn effective_timeout(&self) -> i64 {
        if self.timeout <= 0 {
            10
        } else {
            self.timeout
        }
    }

    /// MsgPack-encodes the request for encryption.
    ///
    /// # Errors
    ///
    /// Returns an internal error when encoding fails.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decodes a request from MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the bytes are not a valid request.
    pub fn from_msgpack(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// A minion's reply to one [`CallRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    /// Echo of the request id.
    pub id: u64,
    /// Outcome discriminant.
    pub result_type: ResultType,
    /// Process exit code.
    pub ret_code: i32,
    /// Combined stdout/stderr, trailing newline trimmed on success.
    #[serde(with = "serde_bytes")]
    pub result: Vec<u8>,
    /// Error text when `result_type` is not `Ok`.
    pub error: String,
}

impl CallResponse {
    /// MsgPack-encodes the response for encryption.
    ///
    /// # Errors
    ///
    /// Returns an internal error when encoding fails.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decodes a response from MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the bytes are not a valid response.
    pub fn from_msgpack(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

// rmp-serde writes Vec<u8> as a msgpack array by default; force the
// compact bin format for command output.
mod serde_bytes {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;
        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }
        de.deserialize_any(BytesVisitor)
    }
}

/// One minion's row in a [`Report`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportItem {
    /// Minion name.
    pub minion: String,
    /// True when the call completed with [`ResultType::Ok`].
    pub result: bool,
    /// Raw command output.
    pub data: Vec<u8>,
    /// Error explanation when `result` is false.
    pub error: String,
}

impl ReportItem {
    /// A pre-allocated slot awaiting a response.
    #[must_use]
    pub fn pending(minion: impl Into<String>) -> Self {
        Self {
            minion: minion.into(),
            ..Self::default()
        }
    }

    /// A failed row carrying only an explanation.
    #[must_use]
    pub fn failed(minion: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            minion: minion.into(),
            error: error.into(),
            ..Self::default()
        }
    }
}

/// Aggregated result of one dispatched call.
///
/// Items preserve target-selection order, not arrival order, and each
/// selected minion appears exactly once. Unresponsive minions keep their
/// pre-allocated slot with an empty or explanatory error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Per-minion rows in selection order.
    pub items: Vec<ReportItem>,
    /// Number of live targets the call was dispatched to.
    pub total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_msgpack_round_trip() {
        let req = CallRequest {
            id: 42,
            function: "echo".to_string(),
            args: vec!["hi".to_string()],
            timeout: 5,
            options: SelectionOptions::parse("*").unwrap(),
        };
        let bytes = req.to_msgpack().unwrap();
        let back = CallRequest::from_msgpack(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn response_msgpack_round_trip_with_binary_payload() {
        let rsp = CallResponse {
            id: 42,
            result_type: ResultType::Ok,
            ret_code: 0,
            result: vec![0x00, 0xff, 0x7f, 0x80],
            error: String::new(),
        };
        let bytes = rsp.to_msgpack().unwrap();
        let back = CallResponse::from_msgpack(&bytes).unwrap();
        assert_eq!(back, rsp);
    }

    #[test]
    fn default_timeout_applies_when_unset() {
        let mut req = CallRequest::default();
        assert_eq!(req.effective_timeout(), 10);
        req.timeout = -3;
        assert_eq!(req.effective_timeout(), 10);
        req.timeout = 30;
        assert_eq!(req.effective_timeout(), 30);
    }
}
