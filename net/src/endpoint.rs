//! The datagram endpoint.
//!
//! Owns the process's single UDP socket. A reader task decodes each
//! inbound datagram into a [`Message`] and hands it to the hosting
//! service through a channel; outbound frames are encoded and written to
//! the address registered for the destination peer. Datagrams that fail
//! to parse are logged and dropped — the reliability layer's
//! retransmissions take care of the rest.

use {
    crate::protocol::ProtocolOutput,
    dgi_core::{Message, RemoteHost, Result},
    log::{debug, warn},
    rand::Rng,
    std::{collections::HashMap, net::SocketAddr, sync::Arc},
    tokio::{net::UdpSocket, sync::mpsc},
};

/// Buffer depth for the inbound channel.
const INBOUND_CHANNEL: usize = 1_024;

/// A decoded inbound frame together with the address it came from.
#[derive(Debug)]
pub struct Inbound {
    /// The decoded message.
    pub message: Message,
    /// The remote socket address that sent it.
    pub from: SocketAddr,
}

/// The node's datagram socket plus outbound address book.
pub struct Endpoint {
    socket: Arc<UdpSocket>,
    resolved: HashMap<RemoteHost, SocketAddr>,
    /// Outgoing delivery probability in percent; 100 = deliver everything.
    /// Lowered only by tests injecting loss.
    reliability: u8,
}

impl Endpoint {
    /// Bind the socket and start the reader task. Returns the endpoint and
    /// the channel of decoded inbound frames.
    pub async fn bind(address: &str, port: u16) -> Result<(Self, mpsc::Receiver<Inbound>)> {
        let socket = Arc::new(UdpSocket::bind((address, port)).await?);
        let local = socket.local_addr()?;
        log::info!("datagram endpoint bound on {local}");

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL);
        let reader = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; dgi_core::MAX_DATAGRAM + 1];
            loop {
                let (len, from) = match reader.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("recv error: {e}");
                        continue;
                    }
                };
                if len > dgi_core::MAX_DATAGRAM {
                    warn!("oversized datagram from {from} ({len} bytes), dropping");
                    continue;
                }
                let message = match Message::decode(&buf[..len]) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("couldn't parse datagram from {from}: {e}");
                        continue;
                    }
                };
                if tx.send(Inbound { message, from }).await.is_err() {
                    debug!("inbound channel closed, stopping reader");
                    break;
                }
            }
        });

        Ok((
            Endpoint {
                socket,
                resolved: HashMap::new(),
                reliability: 100,
            },
            rx,
        ))
    }

    /// The bound local address (useful when port 0 was requested).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Write one frame to a peer's registered address.
    pub async fn send(&mut self, host: &RemoteHost, msg: &Message) -> Result<()> {
        if self.reliability < 100 && rand::thread_rng().gen_range(0..100) >= self.reliability {
            debug!("dropped outgoing datagram seq {} (loss injection)", msg.sequence);
            return Ok(());
        }
        let addr = self.resolve(host).await?;
        let bytes = msg.encode()?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Write a batch of frames produced by a protocol to one peer.
    pub async fn send_all(&mut self, host: &RemoteHost, out: &ProtocolOutput) -> Result<()> {
        for msg in &out.writes {
            self.send(host, msg).await?;
        }
        Ok(())
    }

    /// Degrade outgoing delivery to `percent`% (loss injection for tests).
    pub fn set_reliability(&mut self, percent: u8) {
        self.reliability = percent.min(100);
    }

    async fn resolve(&mut self, host: &RemoteHost) -> Result<SocketAddr> {
        if let Some(addr) = self.resolved.get(host) {
            return Ok(*addr);
        }
        let endpoint = host.to_endpoint_string();
        let addr = tokio::net::lookup_host(endpoint.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                dgi_core::CoreError::Config(format!("cannot resolve host {endpoint}"))
            })?;
        self.resolved.insert(host.clone(), addr);
        Ok(addr)
    }
}

/// Derive a peer's identifier convention from an inbound frame, falling
/// back to the socket address when the frame carries no source host.
pub fn peer_host_of(inbound: &Inbound) -> RemoteHost {
    inbound
        .message
        .source_host
        .clone()
        .unwrap_or_else(|| RemoteHost::new(inbound.from.ip().to_string(), inbound.from.port()))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dgi_core::NodeId;

    fn msg(handler: &str) -> Message {
        let mut m = Message::new(handler);
        m.source = NodeId::from("a:0");
        m
    }

    #[tokio::test]
    async fn test_bind_and_roundtrip() {
        let (mut a, _rx_a) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let (b, mut rx_b) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let b_addr = b.local_addr().unwrap();
        let host = RemoteHost::new("127.0.0.1", b_addr.port());

        a.send(&host, &msg("lb.ping")).await.unwrap();

        let inbound = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            rx_b.recv(),
        )
        .await
        .expect("timeout waiting for datagram")
        .expect("channel open");
        assert_eq!(inbound.message.handler, "lb.ping");
    }

    #[tokio::test]
    async fn test_loss_injection_drops_everything_at_zero() {
        let (mut a, _rx_a) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let (b, mut rx_b) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let host = RemoteHost::new("127.0.0.1", b.local_addr().unwrap().port());
        a.set_reliability(0);
        for _ in 0..5 {
            a.send(&host, &msg("lb.ping")).await.unwrap();
        }
        let got = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            rx_b.recv(),
        )
        .await;
        assert!(got.is_err(), "no datagram should arrive at 0% reliability");
    }

    #[tokio::test]
    async fn test_undecodable_datagram_skipped() {
        let (mut a, _rx_a) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let (b, mut rx_b) = Endpoint::bind("127.0.0.1", 0).await.unwrap();
        let b_addr = b.local_addr().unwrap();
        // Garbage first: the reader must skip it and keep listening.
        let raw = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        raw.send_to(b"not a message", b_addr).await.unwrap();
        let host = RemoteHost::new("127.0.0.1", b_addr.port());
        a.send(&host, &msg("lb.ping")).await.unwrap();
        let inbound = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            rx_b.recv(),
        )
        .await
        .expect("reader survived the bad datagram")
        .expect("channel open");
        assert_eq!(inbound.message.handler, "lb.ping");
    }
}
