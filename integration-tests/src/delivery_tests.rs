//! Reliable-delivery scenarios over the datagram transport.

use {
    crate::harness::UdpNode,
    dgi_core::{Message, MessageKind, NodeId, RemoteHost},
    dgi_net::{Protocol, ProtocolConfig, ReliableProtocol},
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::time::Duration,
};

fn ping(n: usize) -> Message {
    let mut msg = Message::new("lb.ping");
    msg.sub.put("lb.n", n.to_string());
    msg
}

// ═══════════════════════════════════════════════════════════════════════════
//  1. Ordered delivery on a clean link
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_five_messages_delivered_in_order_and_window_drains() {
    let mut a = UdpNode::spawn().await;
    let mut b = UdpNode::spawn().await;
    a.add_peer(&b);
    let b_id = b.id.clone();

    for n in 0..5 {
        a.send(&b_id, ping(n)).await;
    }
    // Let B deliver and ACK, then A absorb the ACKs.
    for _ in 0..10 {
        b.pump(Duration::from_millis(30)).await;
        a.pump(Duration::from_millis(30)).await;
        if a.registry.next_resend_deadline().is_none() && b.delivered.len() == 5 {
            break;
        }
        a.resend_due().await;
    }

    assert_eq!(b.delivered.len(), 5, "all five pings delivered");
    let order: Vec<String> = b
        .delivered
        .iter()
        .map(|m| m.sub.get("lb.n").unwrap().to_string())
        .collect();
    assert_eq!(order, vec!["0", "1", "2", "3", "4"], "in send order");
    // Sequences are contiguous mod 1024.
    let seqs: Vec<u16> = b.delivered.iter().map(|m| m.sequence).collect();
    for pair in seqs.windows(2) {
        assert_eq!((pair[0] + 1) % 1024, pair[1]);
    }
    assert!(
        a.registry.next_resend_deadline().is_none(),
        "sender window drained after the final ACK"
    );
}

// ═══════════════════════════════════════════════════════════════════════════
//  2. Delivery through heavy loss
// ═══════════════════════════════════════════════════════════════════════════

/// Deterministic lossy pipe between two reliable protocol instances:
/// every frame in either direction is dropped with probability 1/2.
fn run_lossy_exchange(seed: u64, message_count: usize) -> (Vec<Message>, usize) {
    let cfg = |name: &str| ProtocolConfig {
        local: NodeId::from(name),
        local_host: RemoteHost::new("h", 1),
        resend_ms: 10,
        default_expire_ms: 60_000,
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sender = ReliableProtocol::sliding(cfg("a:1870"));
    let mut receiver = ReliableProtocol::sliding(cfg("b:1870"));
    let mut delivered: Vec<Message> = Vec::new();
    let mut now = 1_000u64;

    let mut to_receiver: Vec<Message> = Vec::new();
    for n in 0..message_count {
        to_receiver.extend(sender.send(ping(n), now).writes);
    }

    let mut rounds = 0;
    while (delivered.len() < message_count || sender.window_len() > 0) && rounds < 100 {
        rounds += 1;
        let mut to_sender: Vec<Message> = Vec::new();
        for msg in to_receiver.drain(..) {
            if rng.gen_bool(0.5) {
                continue; // lost on the wire
            }
            if msg.kind == MessageKind::Ack {
                to_sender.extend(receiver.receive_ack(&msg, now).writes);
            } else {
                let r = receiver.receive(&msg, now);
                if r.deliver {
                    delivered.push(msg);
                }
                to_sender.extend(r.writes);
            }
        }
        for msg in to_sender.drain(..) {
            if rng.gen_bool(0.5) {
                continue;
            }
            if msg.kind == MessageKind::Ack {
                to_receiver.extend(sender.receive_ack(&msg, now).writes);
            } else {
                to_receiver.extend(sender.receive(&msg, now).writes);
            }
        }
        // Next refire interval.
        now += 10;
        to_receiver.extend(sender.on_resend(now).writes);
    }
    assert_eq!(sender.window_len(), 0, "window drains once acknowledged");
    (delivered, rounds)
}

#[test]
fn test_ten_messages_survive_fifty_percent_loss_in_order() {
    let (delivered, rounds) = run_lossy_exchange(7, 10);
    assert_eq!(delivered.len(), 10, "all ten delivered despite loss");
    let order: Vec<String> = delivered
        .iter()
        .map(|m| m.sub.get("lb.n").unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    assert_eq!(order, expected, "strictly in order");
    assert!(rounds < 100, "bounded number of refire intervals ({rounds})");
}

#[test]
fn test_lossy_delivery_is_exactly_once() {
    for seed in [1, 2, 3] {
        let (delivered, _) = run_lossy_exchange(seed, 10);
        let mut ns: Vec<&str> = delivered.iter().map(|m| m.sub.get("lb.n").unwrap()).collect();
        ns.sort();
        ns.dedup();
        assert_eq!(ns.len(), 10, "no duplicates under retransmission");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  6. Session reset after restart
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_restarted_sender_resets_session() {
    let mut a = UdpNode::spawn().await;
    let mut b = UdpNode::spawn().await;
    a.add_peer(&b);
    let a_port = a.host.port;
    let b_id = b.id.clone();

    a.send(&b_id, ping(0)).await;
    for _ in 0..5 {
        b.pump(Duration::from_millis(20)).await;
        a.pump(Duration::from_millis(20)).await;
        if b.delivered.len() == 1 {
            break;
        }
        a.resend_due().await;
    }
    assert_eq!(b.delivered.len(), 1);

    // "Restart" A: a brand-new stack with the same identity. Its first
    // send opens a fresh session whose SYN is later than anything B has
    // accepted; B must flush and accept the restarted sequence space.
    drop(a);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut a2 = UdpNode::spawn().await;
    // Keep the old identity: B's directory is keyed by it.
    a2.id = NodeId::from_endpoint("127.0.0.1", a_port);
    a2.registry = dgi_net::PeerRegistry::new(ProtocolConfig {
        local: a2.id.clone(),
        local_host: RemoteHost::new("127.0.0.1", a2.host.port),
        resend_ms: 10,
        default_expire_ms: 2_000,
    });
    a2.add_peer(&b);

    a2.send(&b_id, ping(99)).await;
    for _ in 0..5 {
        b.pump(Duration::from_millis(20)).await;
        a2.pump(Duration::from_millis(20)).await;
        if b.delivered.len() == 2 {
            break;
        }
        a2.resend_due().await;
    }
    assert_eq!(b.delivered.len(), 2, "post-restart message accepted");
    assert_eq!(b.delivered[1].sub.get("lb.n"), Some("99"));
}
