//! The application-level message frame and its wire encoding.
//!
//! Every datagram on the network carries exactly one bincode-encoded
//! [`Message`]. A message is a value object: it is serialized in full per
//! transmission, and mutating it after a send has no effect on what the
//! peer sees. The payload proper lives in a nested key/value tree
//! ([`SubTree`]) addressed by dotted paths, which keeps the frame schema
//! stable while letting each agent define its own submessage layout.

use {
    crate::{
        error::{CoreError, Result},
        identifier::{NodeId, RemoteHost},
    },
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

/// Maximum encoded size of a single datagram payload, in bytes.
pub const MAX_DATAGRAM: usize = 60_000;

/// Sequence numbers wrap at this modulus.
pub const SEQUENCE_MODULO: u16 = 1024;

// ── Submessage tree ─────────────────────────────────────────────────────────

/// A value stored in a [`SubTree`]: either a leaf string or a nested tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubValue {
    /// Leaf payload.
    Text(String),
    /// Nested subtree.
    Tree(SubTree),
}

/// Ordered key/value tree with dotted-path addressing.
///
/// Duplicate keys are permitted (`add` appends, `put` replaces the first
/// match), matching how peer lists and state collections store repeated
/// entries under the same key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubTree {
    entries: Vec<(String, SubValue)>,
}

impl SubTree {
    /// An empty tree.
    pub fn new() -> Self {
        SubTree::default()
    }

    /// Replace (or create) the leaf at `path`, creating intermediate trees.
    pub fn put(&mut self, path: &str, value: impl Into<String>) {
        let (tree, leaf) = self.descend_mut(path);
        let value = value.into();
        for (k, v) in tree.entries.iter_mut() {
            if k == leaf {
                *v = SubValue::Text(value);
                return;
            }
        }
        tree.entries.push((leaf.to_string(), SubValue::Text(value)));
    }

    /// Append a new leaf at `path`, even if the key already exists.
    pub fn add(&mut self, path: &str, value: impl Into<String>) {
        let (tree, leaf) = self.descend_mut(path);
        tree.entries
            .push((leaf.to_string(), SubValue::Text(value.into())));
    }

    /// Append a subtree at `path`, even if the key already exists.
    pub fn add_child(&mut self, path: &str, child: SubTree) {
        let (tree, leaf) = self.descend_mut(path);
        tree.entries.push((leaf.to_string(), SubValue::Tree(child)));
    }

    /// Fetch the first leaf value at `path`.
    pub fn get<'a>(&'a self, path: &str) -> Option<&'a str> {
        let (tree, leaf) = self.descend(path)?;
        tree.entries.iter().find_map(move |(k, v)| match v {
            SubValue::Text(s) if k == leaf => Some(s.as_str()),
            _ => None,
        })
    }

    /// Fetch and parse the first leaf value at `path`.
    pub fn get_parsed<T: std::str::FromStr>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|s| s.parse().ok())
    }

    /// Fetch the first subtree at `path`.
    pub fn get_child<'a>(&'a self, path: &str) -> Option<&'a SubTree> {
        let (tree, leaf) = self.descend(path)?;
        tree.entries.iter().find_map(move |(k, v)| match v {
            SubValue::Tree(t) if k == leaf => Some(t),
            _ => None,
        })
    }

    /// Iterate over every subtree stored under `key` at this level.
    pub fn trees<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a SubTree> + 'a {
        self.entries.iter().filter_map(move |(k, v)| match v {
            SubValue::Tree(t) if k == key => Some(t),
            _ => None,
        })
    }

    /// Iterate over every leaf stored under `key` at this level.
    pub fn leaves<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries.iter().filter_map(move |(k, v)| match v {
            SubValue::Text(s) if k == key => Some(s.as_str()),
            _ => None,
        })
    }

    /// All entries at this level, in insertion order.
    pub fn entries(&self) -> &[(String, SubValue)] {
        &self.entries
    }

    /// True if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walk all path segments but the last, creating trees as needed.
    fn descend_mut<'a>(&'a mut self, path: &'a str) -> (&'a mut SubTree, &'a str) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let leaf = segments.pop().unwrap_or(path);
        let mut tree = self;
        for seg in segments {
            let pos = tree
                .entries
                .iter()
                .position(|(k, v)| k == seg && matches!(v, SubValue::Tree(_)));
            let idx = match pos {
                Some(i) => i,
                None => {
                    tree.entries
                        .push((seg.to_string(), SubValue::Tree(SubTree::new())));
                    tree.entries.len() - 1
                }
            };
            tree = match &mut tree.entries[idx].1 {
                SubValue::Tree(t) => t,
                SubValue::Text(_) => unreachable!("position() only matches trees"),
            };
        }
        (tree, leaf)
    }

    /// Walk all path segments but the last without creating anything.
    fn descend<'a, 'b>(&'a self, path: &'b str) -> Option<(&'a SubTree, &'b str)> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let leaf = segments.pop()?;
        let mut tree = self;
        for seg in segments {
            tree = tree.entries.iter().find_map(|(k, v)| match v {
                SubValue::Tree(t) if k == seg => Some(t),
                _ => None,
            })?;
        }
        Some((tree, leaf))
    }
}

// ── Message frame ───────────────────────────────────────────────────────────

/// The role a frame plays in the reliable-messaging layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ordinary application payload.
    Data,
    /// Session open/reset control frame.
    Syn,
    /// Acknowledgement of an accepted frame.
    Ack,
    /// The receiver could not make sense of the sender's session; the
    /// sender should resynchronize.
    BadRequest,
    /// Clock-synchronization traffic, routed straight to the synchronizer.
    ClockReading,
}

/// Which send discipline carries a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// `UNR` — fire and forget.
    Unreliable,
    /// `SRC` — reliable sequenced with sliding window and resync (default).
    Reliable,
    /// `SRS` — reliable sequenced, strict ordering, window of one.
    Strict,
}

impl ProtocolKind {
    /// Three-letter wire identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Unreliable => "UNR",
            ProtocolKind::Reliable => "SRC",
            ProtocolKind::Strict => "SRS",
        }
    }
}

/// Message expiration. `Unset` means the sending protocol may stamp its
/// default deadline; `Never` suppresses that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiry {
    /// No deadline chosen yet.
    Unset,
    /// The message never expires.
    Never,
    /// Expires at this wall-clock time (ms since epoch).
    At(u64),
}

/// A single application-level frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier of the sending node.
    pub source: NodeId,
    /// Optional destination hint.
    pub destination: Option<NodeId>,
    /// Where the sender can be reached (lets a receiver register unknown
    /// peers on first contact).
    pub source_host: Option<RemoteHost>,
    /// Frame role.
    pub kind: MessageKind,
    /// Send discipline that carried (or will carry) this frame.
    pub protocol: ProtocolKind,
    /// Handler tag, `module.subhandler`.
    pub handler: String,
    /// Sequence number modulo [`SEQUENCE_MODULO`].
    pub sequence: u16,
    /// Wall-clock send time (ms since epoch), stamped by the protocol.
    pub sent_at_ms: u64,
    /// Expiration deadline.
    pub expires: Expiry,
    /// Permits acceptance outside the sequence window. Set on
    /// self-timestamped traffic (the clock exchanges) that stays useful
    /// regardless of where the session's sequence state sits.
    pub accept: bool,
    /// On an ACK: content hash of the acknowledged frame.
    pub ack_hash: Option<u64>,
    /// Kill boundary: every pending frame at or before this sequence was
    /// dropped by the sender and should not be awaited.
    pub kill: Option<u16>,
    /// Application payload.
    pub sub: SubTree,
}

impl Message {
    /// A fresh data message for the given handler tag.
    pub fn new(handler: impl Into<String>) -> Self {
        Message {
            source: NodeId::new(""),
            destination: None,
            source_host: None,
            kind: MessageKind::Data,
            protocol: ProtocolKind::Reliable,
            handler: handler.into(),
            sequence: 0,
            sent_at_ms: 0,
            expires: Expiry::Unset,
            accept: false,
            ack_hash: None,
            kill: None,
            sub: SubTree::new(),
        }
    }

    /// The module portion of the handler tag (`"gm.Invite"` → `"gm"`).
    pub fn handler_module(&self) -> &str {
        self.handler.split('.').next().unwrap_or(&self.handler)
    }

    /// Set the expiration `dur_ms` milliseconds after `now_ms`.
    pub fn expire_from(&mut self, now_ms: u64, dur_ms: u64) {
        self.expires = Expiry::At(now_ms.saturating_add(dur_ms));
    }

    /// Mark the message as never expiring.
    pub fn never_expires(&mut self) {
        self.expires = Expiry::Never;
    }

    /// True once the expiration deadline has passed.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires {
            Expiry::At(t) => now_ms > t,
            Expiry::Unset | Expiry::Never => false,
        }
    }

    /// Content hash used to match ACKs to the exact frame they acknowledge.
    pub fn content_hash(&self) -> u64 {
        let bytes = bincode::serialize(self).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }

    /// Serialize for transmission, refusing anything over [`MAX_DATAGRAM`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(CoreError::Overflow {
                size: bytes.len(),
                max: MAX_DATAGRAM,
            });
        }
        Ok(bytes)
    }

    /// Deserialize a datagram payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Human-readable tag for logging.
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            MessageKind::Data => "data",
            MessageKind::Syn => "syn",
            MessageKind::Ack => "ack",
            MessageKind::BadRequest => "bad_request",
            MessageKind::ClockReading => "clock",
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtree_put_and_get() {
        let mut t = SubTree::new();
        t.put("gm.source", "x:1870");
        t.put("gm.groupid", "7");
        assert_eq!(t.get("gm.source"), Some("x:1870"));
        assert_eq!(t.get_parsed::<u64>("gm.groupid"), Some(7));
        assert_eq!(t.get("gm.missing"), None);
    }

    #[test]
    fn test_subtree_put_replaces() {
        let mut t = SubTree::new();
        t.put("a.b", "1");
        t.put("a.b", "2");
        assert_eq!(t.get("a.b"), Some("2"));
        assert_eq!(t.get_child("a").unwrap().entries().len(), 1);
    }

    #[test]
    fn test_subtree_add_allows_duplicates() {
        let mut t = SubTree::new();
        t.add("sc.devices.device", "Sst:gateway");
        t.add("sc.devices.device", "Load:drain");
        let devices: Vec<&str> = t
            .get_child("sc.devices")
            .unwrap()
            .leaves("device")
            .collect();
        assert_eq!(devices, vec!["Sst:gateway", "Load:drain"]);
    }

    #[test]
    fn test_subtree_add_child_iteration() {
        let mut t = SubTree::new();
        for uuid in ["x", "y"] {
            let mut peer = SubTree::new();
            peer.add("uuid", uuid);
            peer.add("port", "1870");
            t.add_child("any.peers.peer", peer);
        }
        let peers: Vec<&str> = t
            .get_child("any.peers")
            .unwrap()
            .trees("peer")
            .map(|p| p.get("uuid").unwrap())
            .collect();
        assert_eq!(peers, vec!["x", "y"]);
    }

    #[test]
    fn test_roundtrip_message() {
        let mut msg = Message::new("lb.ping");
        msg.source = NodeId::from("a:1870");
        msg.sequence = 3;
        msg.sub.put("lb.value", "1.5");
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_content_hash_matches_across_codec() {
        let mut msg = Message::new("gm.Invite");
        msg.source = NodeId::from("y:1870");
        msg.sent_at_ms = 12345;
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg.content_hash(), decoded.content_hash());
    }

    #[test]
    fn test_oversized_message_refused() {
        let mut msg = Message::new("sc.state");
        msg.sub.put("blob", "x".repeat(MAX_DATAGRAM));
        match msg.encode() {
            Err(CoreError::Overflow { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_DATAGRAM);
            }
            other => panic!("expected Overflow, got {other:?}"),
        }
    }

    #[test]
    fn test_expiry() {
        let mut msg = Message::new("x.y");
        assert!(!msg.is_expired(u64::MAX));
        msg.expire_from(1_000, 500);
        assert!(!msg.is_expired(1_500));
        assert!(msg.is_expired(1_501));
        msg.never_expires();
        assert!(!msg.is_expired(u64::MAX));
    }

    #[test]
    fn test_handler_module() {
        assert_eq!(Message::new("gm.AreYouThere").handler_module(), "gm");
        assert_eq!(Message::new("any.PeerList").handler_module(), "any");
    }

    #[test]
    fn test_protocol_tags() {
        assert_eq!(ProtocolKind::Unreliable.as_str(), "UNR");
        assert_eq!(ProtocolKind::Reliable.as_str(), "SRC");
        assert_eq!(ProtocolKind::Strict.as_str(), "SRS");
    }
}
