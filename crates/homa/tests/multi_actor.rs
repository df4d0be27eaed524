//! Two `Transport` instances wired directly to each other through a
//! synchronous bridge, rather than real sockets or background threads.
//! `IpSend::send` on one side calls `receive` on the other inline, so a
//! whole multi-round transfer (unscheduled prefix, a GRANT, the granted
//! DATA it unlocks) resolves within a single top-level `send()` call and
//! needs no sleeping or timer thread — complementary to `src/scenarios.rs`,
//! which drives the same engine over real UDP sockets and real time instead.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use homa::config::HomaConfig;
use homa::id::mirror;
use homa::peer::PeerKey;
use homa::protocol::Packet;
use homa::{Error, IpSend, Transport};

struct Bridge {
    local_addr: IpAddr,
    peer: Mutex<Weak<Transport<Bridge>>>,
    /// When set, every DATA segment starting at this offset is silently
    /// dropped instead of forwarded — for the "never recovers" test, which
    /// asserts on the *absence* of a timer rather than needing one.
    drop_offset: Mutex<Option<u32>>,
}

impl Bridge {
    fn new(local_addr: IpAddr) -> Arc<Self> {
        Arc::new(Self { local_addr, peer: Mutex::new(Weak::new()), drop_offset: Mutex::new(None) })
    }

    fn link(a: &Arc<Self>, b: &Arc<Transport<Bridge>>) {
        *a.peer.lock().unwrap() = Arc::downgrade(b);
    }
}

impl IpSend for Bridge {
    fn send(&self, _namespace: u32, _dest: PeerKey, dest_port: u16, _src_port: u16, packet: &Packet) {
        if let (Packet::Data(d), Some(offset)) = (packet, *self.drop_offset.lock().unwrap()) {
            if d.offset == offset {
                return;
            }
        }
        if let Some(peer) = self.peer.lock().unwrap().upgrade() {
            let bytes = packet.encode();
            peer.receive(dest_port, self.local_addr, &bytes, None);
        }
    }
}

fn wire_pair(config: &HomaConfig) -> (Arc<Transport<Bridge>>, Arc<Bridge>, Arc<Transport<Bridge>>, Arc<Bridge>) {
    let ip_a = Bridge::new("10.0.0.1".parse().unwrap());
    let ip_b = Bridge::new("10.0.0.2".parse().unwrap());
    let transport_a = Transport::new(0, config.clone(), ip_a.clone());
    let transport_b = Transport::new(0, config.clone(), ip_b.clone());
    Bridge::link(&ip_a, &transport_b);
    Bridge::link(&ip_b, &transport_a);
    (transport_a, ip_a, transport_b, ip_b)
}

#[test]
fn request_response_round_trips_without_threads() {
    let config = HomaConfig::default();
    let (client, _ip_a, server, _ip_b) = wire_pair(&config);

    let client_socket = client.open(0).unwrap();
    client_socket.set_rcvbuf(1 << 20).unwrap();
    let server_socket = server.open(9000).unwrap();
    server_socket.set_rcvbuf(1 << 20).unwrap();

    let peer = client.peers().find_or_create(0, "10.0.0.2".parse().unwrap(), 0);
    let request_id =
        client.send(&client_socket, Some((peer, 9000)), 0, Bytes::from(vec![1u8; 64]), 7, false, true).unwrap();

    let request = server_socket.recvmsg(&[], None, true, None, 0).unwrap();
    assert_eq!(request.length, 64);
    assert_eq!(request.id, mirror(request_id));

    server.send(&server_socket, None, request.id, Bytes::from(vec![2u8; 128]), 0, false, true).unwrap();

    let response = client_socket.recvmsg(&[], Some(request_id), true, None, 0).unwrap();
    assert_eq!(response.length, 128);
    assert_eq!(response.completion_cookie, 7);
}

#[test]
fn message_above_unsched_bytes_completes_via_synchronous_grant_chain() {
    let mut config = HomaConfig::default();
    config.unsched_bytes = 1_000;
    config.window = 50_000;
    config.max_gso_size = 9_000;
    let (client, _ip_a, server, _ip_b) = wire_pair(&config);

    let client_socket = client.open(0).unwrap();
    client_socket.set_rcvbuf(1 << 21).unwrap();
    let server_socket = server.open(9001).unwrap();
    server_socket.set_rcvbuf(1 << 21).unwrap();

    let peer = client.peers().find_or_create(0, "10.0.0.2".parse().unwrap(), 0);
    let message_len = 40_000usize;
    client
        .send(&client_socket, Some((peer, 9001)), 0, Bytes::from(vec![3u8; message_len]), 0, false, true)
        .unwrap();

    // No thread, no sleep: the GRANT round trip this message needs already
    // happened inline inside `send`, via the bridge calling `receive`
    // recursively on whichever side produced the next packet.
    let request = server_socket.recvmsg(&[], None, true, None, 0).unwrap();
    assert_eq!(request.length, message_len);
}

#[test]
fn a_missing_segment_leaves_the_message_incomplete_without_a_timer() {
    let mut config = HomaConfig::default();
    config.unsched_bytes = 1_000;
    config.window = 50_000;
    config.max_gso_size = 9_000;
    let (client, ip_a, server, _ip_b) = wire_pair(&config);

    let client_socket = client.open(0).unwrap();
    client_socket.set_rcvbuf(1 << 21).unwrap();
    let server_socket = server.open(9002).unwrap();
    server_socket.set_rcvbuf(1 << 21).unwrap();

    *ip_a.drop_offset.lock().unwrap() = Some(1_000);

    let peer = client.peers().find_or_create(0, "10.0.0.2".parse().unwrap(), 0);
    client.send(&client_socket, Some((peer, 9002)), 0, Bytes::from(vec![4u8; 40_000]), 0, false, true).unwrap();

    // Nothing drives `timer.rs` here, so the dropped segment is never
    // resent: the message should still be sitting incomplete.
    let result = server_socket.recvmsg(&[], None, true, None, 0);
    assert!(matches!(result, Err(Error::WouldBlock)));
}
