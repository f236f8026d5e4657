//! Protocol messages for the policy feed.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Subscription descriptor sent when opening an update stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Opaque subscription tag selecting the feed.
    pub subscription: String,
    /// Client understands drop-action overrides on policy updates.
    pub supports_drop_action_override: bool,
    /// Client is able to report dataplane statistics.
    pub supports_dataplane_stats: bool,
}

impl SyncRequest {
    /// Creates a request for the given subscription with all features enabled.
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            supports_drop_action_override: true,
            supports_dataplane_stats: true,
        }
    }

    /// Sets the drop-action override capability.
    pub fn with_drop_action_override(mut self, enabled: bool) -> Self {
        self.supports_drop_action_override = enabled;
        self
    }

    /// Sets the dataplane stats capability.
    pub fn with_dataplane_stats(mut self, enabled: bool) -> Self {
        self.supports_dataplane_stats = enabled;
        self
    }
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Kind of an update carried on the feed.
///
/// The sync engine never looks at this tag; it only exists so consumers can
/// route updates without decoding the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Marks the end of the initial snapshot.
    InSync,
    /// Full replacement of an IP set.
    IpSetUpdate,
    /// Incremental change to an IP set.
    IpSetDeltaUpdate,
    /// IP set removed.
    IpSetRemove,
    /// Profile created or updated.
    ProfileUpdate,
    /// Profile removed.
    ProfileRemove,
    /// Policy created or updated.
    PolicyUpdate,
    /// Policy removed.
    PolicyRemove,
    /// Workload endpoint created or updated.
    EndpointUpdate,
    /// Workload endpoint removed.
    EndpointRemove,
    /// Route created or updated.
    RouteUpdate,
    /// Route removed.
    RouteRemove,
}

impl UpdateKind {
    /// Returns true if this kind deletes the keyed object.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            UpdateKind::IpSetRemove
                | UpdateKind::ProfileRemove
                | UpdateKind::PolicyRemove
                | UpdateKind::EndpointRemove
                | UpdateKind::RouteRemove
        )
    }

    /// Stable lowercase name, used in logs and feed files.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::InSync => "in_sync",
            UpdateKind::IpSetUpdate => "ipset_update",
            UpdateKind::IpSetDeltaUpdate => "ipset_delta_update",
            UpdateKind::IpSetRemove => "ipset_remove",
            UpdateKind::ProfileUpdate => "profile_update",
            UpdateKind::ProfileRemove => "profile_remove",
            UpdateKind::PolicyUpdate => "policy_update",
            UpdateKind::PolicyRemove => "policy_remove",
            UpdateKind::EndpointUpdate => "endpoint_update",
            UpdateKind::EndpointRemove => "endpoint_remove",
            UpdateKind::RouteUpdate => "route_update",
            UpdateKind::RouteRemove => "route_remove",
        }
    }

    /// Every kind, in declaration order.
    pub const ALL: [UpdateKind; 12] = [
        UpdateKind::InSync,
        UpdateKind::IpSetUpdate,
        UpdateKind::IpSetDeltaUpdate,
        UpdateKind::IpSetRemove,
        UpdateKind::ProfileUpdate,
        UpdateKind::ProfileRemove,
        UpdateKind::PolicyUpdate,
        UpdateKind::PolicyRemove,
        UpdateKind::EndpointUpdate,
        UpdateKind::EndpointRemove,
        UpdateKind::RouteUpdate,
        UpdateKind::RouteRemove,
    ];

    /// Object family the kind applies to; updates and removals of the same
    /// family share a key space.
    pub fn family(&self) -> &'static str {
        match self {
            UpdateKind::InSync => "sync",
            UpdateKind::IpSetUpdate | UpdateKind::IpSetDeltaUpdate | UpdateKind::IpSetRemove => {
                "ipset"
            }
            UpdateKind::ProfileUpdate | UpdateKind::ProfileRemove => "profile",
            UpdateKind::PolicyUpdate | UpdateKind::PolicyRemove => "policy",
            UpdateKind::EndpointUpdate | UpdateKind::EndpointRemove => "endpoint",
            UpdateKind::RouteUpdate | UpdateKind::RouteRemove => "route",
        }
    }
}

impl FromStr for UpdateKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpdateKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::decode(format!("unknown update kind '{s}'")))
    }
}

/// A single update received from the remote authority.
///
/// Identity is positional: `sequence` is assigned by the server in emit
/// order. Bodies are opaque to the transport and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    /// Server-assigned sequence number.
    pub sequence: u64,
    /// Update kind.
    pub kind: UpdateKind,
    /// Key of the object being updated.
    pub key: String,
    /// Opaque body.
    #[serde(with = "serde_bytes_compat")]
    pub body: Vec<u8>,
}

impl UpdateEnvelope {
    /// Creates a new envelope.
    pub fn new(sequence: u64, kind: UpdateKind, key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            sequence,
            kind,
            key: key.into(),
            body,
        }
    }

    /// Creates the in-sync marker.
    pub fn in_sync(sequence: u64) -> Self {
        Self::new(sequence, UpdateKind::InSync, "", Vec::new())
    }
}

/// Per-connection HTTP request counters reported back to the server.
///
/// One report covers one connection tuple; counters are deltas since the
/// previous report for that tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplaneStats {
    /// Source address.
    pub src_ip: String,
    /// Destination address.
    pub dst_ip: String,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Protocol name, e.g. `tcp`.
    pub protocol: String,
    /// HTTP requests allowed by policy.
    pub http_requests_allowed: u64,
    /// HTTP requests denied by policy.
    pub http_requests_denied: u64,
}

impl DataplaneStats {
    /// Creates a report with zeroed counters.
    pub fn new(
        src_ip: impl Into<String>,
        dst_ip: impl Into<String>,
        src_port: u16,
        dst_port: u16,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            src_ip: src_ip.into(),
            dst_ip: dst_ip.into(),
            src_port,
            dst_port,
            protocol: protocol.into(),
            http_requests_allowed: 0,
            http_requests_denied: 0,
        }
    }

    /// Sets the allowed and denied request counts.
    pub fn with_http_requests(mut self, allowed: u64, denied: u64) -> Self {
        self.http_requests_allowed = allowed;
        self.http_requests_denied = denied;
        self
    }

    /// Returns true if there is nothing to report.
    pub fn is_empty(&self) -> bool {
        self.http_requests_allowed == 0 && self.http_requests_denied == 0
    }
}

/// A frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client opens a subscription.
    Subscribe(SyncRequest),
    /// Server pushes an update.
    Update(UpdateEnvelope),
    /// Client reports dataplane statistics on an open subscription.
    Report(DataplaneStats),
    /// Server rejects the session.
    Error(String),
}

impl Frame {
    /// Returns the frame kind name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Subscribe(_) => "subscribe",
            Frame::Update(_) => "update",
            Frame::Report(_) => "report",
            Frame::Error(_) => "error",
        }
    }
}

/// Encodes `Vec<u8>` as a CBOR byte string instead of an array of integers.
mod serde_bytes_compat {
    use serde::de::{Deserializer, Error, SeqAccess, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
