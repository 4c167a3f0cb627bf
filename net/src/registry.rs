//! Process-wide peer directory.
//!
//! Maps node identifier → connection, creating connection state lazily on
//! first mention of a peer. Connections are never duplicated and never
//! freed on peer loss — group management prunes logical membership while
//! the protocol state stays in place, which makes reconnection cheap.

use {
    crate::{
        connection::Connection,
        protocol::ProtocolConfig,
    },
    dgi_core::{NodeId, RemoteHost},
    log::{debug, info},
    std::collections::HashMap,
};

/// The shared directory of peers and their connections.
pub struct PeerRegistry {
    local: NodeId,
    local_host: RemoteHost,
    cfg: ProtocolConfig,
    hostnames: HashMap<NodeId, RemoteHost>,
    connections: HashMap<NodeId, Connection>,
}

impl PeerRegistry {
    /// Create the registry for this node.
    pub fn new(cfg: ProtocolConfig) -> Self {
        let local = cfg.local.clone();
        let local_host = cfg.local_host.clone();
        let mut hostnames = HashMap::new();
        hostnames.insert(local.clone(), local_host.clone());
        PeerRegistry {
            local,
            local_host,
            cfg,
            hostnames,
            connections: HashMap::new(),
        }
    }

    /// This node's identifier.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// This node's reachable address.
    pub fn local_host(&self) -> &RemoteHost {
        &self.local_host
    }

    /// Register (or refresh) a peer's address. Idempotent; performs no
    /// connectivity test.
    pub fn put_hostname(&mut self, id: NodeId, host: RemoteHost) {
        if self.hostnames.insert(id.clone(), host).is_none() {
            info!("registered peer {id}");
        }
    }

    /// The registered address of a peer, if known.
    pub fn host_of(&self, id: &NodeId) -> Option<&RemoteHost> {
        self.hostnames.get(id)
    }

    /// Every known peer identifier, this node included, in sorted order.
    pub fn known_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.hostnames.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// The connection to a peer, created on first use.
    pub fn connection(&mut self, id: &NodeId) -> &mut Connection {
        if !self.connections.contains_key(id) {
            debug!("making fresh connection to {id}");
            self.connections
                .insert(id.clone(), Connection::new(id.clone(), self.cfg.clone()));
        }
        self.connections.get_mut(id).expect("inserted above")
    }

    /// Broadcast a phase change to every live connection.
    pub fn change_phase(&mut self, new_round: bool) {
        for conn in self.connections.values_mut() {
            conn.change_phase(new_round);
        }
    }

    /// The earliest retransmission deadline across every connection.
    pub fn next_resend_deadline(&self) -> Option<u64> {
        self.connections
            .values()
            .filter_map(Connection::resend_deadline)
            .min()
    }

    /// Fire due retransmissions, returning `(peer, frame)` pairs to write.
    pub fn collect_resends(&mut self, now_ms: u64) -> Vec<(NodeId, dgi_core::Message)> {
        let mut writes = Vec::new();
        for (peer, conn) in self.connections.iter_mut() {
            for msg in conn.on_resend(now_ms).writes {
                writes.push((peer.clone(), msg));
            }
        }
        writes
    }

    /// Stop every connection; outstanding timers are cancelled.
    pub fn stop_all(&mut self) {
        for conn in self.connections.values_mut() {
            conn.stop();
        }
        debug!("all connections stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(ProtocolConfig {
            local: NodeId::from("a:1870"),
            local_host: RemoteHost::new("a", 1870),
            resend_ms: 10,
            default_expire_ms: 1_000,
        })
    }

    #[test]
    fn test_lazy_connection_creation() {
        let mut reg = registry();
        let b = NodeId::from("b:1870");
        assert!(reg.connections.is_empty());
        let conn = reg.connection(&b);
        assert_eq!(conn.peer(), &b);
        reg.connection(&b);
        assert_eq!(reg.connections.len(), 1, "never duplicated per peer");
    }

    #[test]
    fn test_put_hostname_idempotent() {
        let mut reg = registry();
        let b = NodeId::from("b:1870");
        reg.put_hostname(b.clone(), RemoteHost::new("b", 1870));
        reg.put_hostname(b.clone(), RemoteHost::new("b", 1870));
        assert_eq!(reg.host_of(&b), Some(&RemoteHost::new("b", 1870)));
        assert_eq!(reg.known_peers().len(), 2); // self + b
    }

    #[test]
    fn test_known_peers_sorted() {
        let mut reg = registry();
        reg.put_hostname(NodeId::from("c:1"), RemoteHost::new("c", 1));
        reg.put_hostname(NodeId::from("b:1"), RemoteHost::new("b", 1));
        let peers = reg.known_peers();
        let strs: Vec<&str> = peers.iter().map(NodeId::as_str).collect();
        assert_eq!(strs, vec!["a:1870", "b:1", "c:1"]);
    }

    #[test]
    fn test_resend_deadline_spans_connections() {
        let mut reg = registry();
        assert!(reg.next_resend_deadline().is_none());
        let b = NodeId::from("b:1870");
        reg.connection(&b).send(dgi_core::Message::new("gm.Invite"), 1_000);
        assert_eq!(reg.next_resend_deadline(), Some(1_010));
        let writes = reg.collect_resends(1_010);
        assert!(!writes.is_empty());
        assert!(writes.iter().all(|(peer, _)| *peer == b));
    }

    #[test]
    fn test_stop_all() {
        let mut reg = registry();
        let b = NodeId::from("b:1870");
        reg.connection(&b).send(dgi_core::Message::new("gm.Invite"), 1_000);
        reg.stop_all();
        assert!(reg.next_resend_deadline().is_none());
    }
}
