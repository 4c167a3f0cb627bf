//! Node naming and addressing.
//!
//! Every node is named by an opaque string identifier that doubles as the
//! directory key for connections and the ordering tiebreak in elections.
//! Identifiers are either the lowercased `host:port` pair itself or a
//! name-based UUID derived from it; both forms are stable for the process
//! lifetime and compare lexicographically.

use {
    serde::{Deserialize, Serialize},
    std::fmt,
    uuid::Uuid,
};

/// Opaque node identifier.
///
/// Wire representations must be byte-equal to the locally stored form for
/// directory lookups to succeed, so construction normalizes the hostname
/// portion to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Build an identifier directly from a host/port pair (`host:port`,
    /// hostname lowercased).
    pub fn from_endpoint(host: &str, port: u16) -> Self {
        NodeId(format!("{}:{}", host.to_lowercase(), port))
    }

    /// Build a name-based (v5) UUID identifier over the `host:port` pair.
    pub fn hashed_endpoint(host: &str, port: u16) -> Self {
        let name = format!("{}:{}", host.to_lowercase(), port);
        NodeId(
            Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes())
                .hyphenated()
                .to_string(),
        )
    }

    /// Wrap an arbitrary identifier string (used by tests and peer lists
    /// received off the wire).
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Network location of a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHost {
    /// Hostname or IP literal, lowercased.
    pub hostname: String,
    /// Datagram port.
    pub port: u16,
}

impl RemoteHost {
    /// Create a host record, normalizing the hostname.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        RemoteHost {
            hostname: hostname.into().to_lowercase(),
            port,
        }
    }

    /// `host:port` form suitable for address resolution.
    pub fn to_endpoint_string(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}
