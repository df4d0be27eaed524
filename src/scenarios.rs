//! End-to-end scenarios over real loopback UDP sockets.
//!
//! Each scenario opens real sockets, drives a fixed piece of work, and
//! checks a pass/fail property of one piece of protocol behavior, run
//! against two [`homa::Transport`] instances wired to real
//! `std::net::UdpSocket`s on distinct loopback addresses so each actor gets
//! its own `PeerKey`.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use homa::config::HomaConfig;
use homa::peer::PeerKey;
use homa::protocol::Packet;
use homa::{Error, Socket, Transport};
use serde::Serialize;

/// One packet `UdpIp` actually wrote to the wire, kept for scenarios that
/// need to assert something about the shape of traffic rather than just its
/// end-to-end outcome. Grounded on `transport.rs`'s own `Capture` test
/// struct, generalized to log over a real socket instead of an in-memory
/// channel.
#[derive(Debug, Clone, Copy)]
enum LoggedPacket {
    Data { offset: u32, length: u32 },
    Grant { offset: u32 },
}

/// [`homa::IpSend`] over one OS UDP socket talking to a single fixed peer.
/// Every scenario here is a strict two-party exchange, so there's no need
/// for the general peer-routing a multi-party `IpSend` would require;
/// `PeerKey`/`dest_port` from the engine are ignored and every packet goes
/// to `peer_addr`, with the Homa-level port routing happening purely from
/// the packet's own `dst_port` on the receiving end.
struct UdpIp {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    drop_once: Mutex<HashSet<u32>>,
    log: Mutex<Vec<LoggedPacket>>,
}

impl UdpIp {
    fn new(socket: UdpSocket, peer_addr: SocketAddr) -> Self {
        Self { socket, peer_addr, drop_once: Mutex::new(HashSet::new()), log: Mutex::new(Vec::new()) }
    }

    /// Arms a one-shot simulated loss of the next outbound DATA segment
    /// starting at `offset`. Cleared on first match, so the eventual
    /// RESEND-driven retransmit of the same offset goes through.
    fn drop_once_at(&self, offset: u32) {
        self.drop_once.lock().unwrap().insert(offset);
    }

    fn take_log(&self) -> Vec<LoggedPacket> {
        std::mem::take(&mut self.log.lock().unwrap())
    }
}

impl homa::IpSend for UdpIp {
    fn send(&self, _namespace: u32, _dest: PeerKey, _dest_port: u16, _src_port: u16, packet: &Packet) {
        if let Packet::Data(data) = packet {
            if self.drop_once.lock().unwrap().remove(&data.offset) {
                return;
            }
        }
        match packet {
            Packet::Data(d) => {
                self.log.lock().unwrap().push(LoggedPacket::Data { offset: d.offset, length: d.segment.len() as u32 })
            }
            Packet::Grant(g) => self.log.lock().unwrap().push(LoggedPacket::Grant { offset: g.offset }),
            _ => {}
        }
        let bytes = packet.encode();
        if let Err(err) = self.socket.send_to(&bytes, self.peer_addr) {
            tracing::warn!(%err, addr = %self.peer_addr, "udp send failed");
        }
    }
}

fn spawn_receive_loop(
    socket: UdpSocket,
    transport: Arc<Transport<UdpIp>>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    socket.set_read_timeout(Some(Duration::from_millis(20))).expect("set_read_timeout");
    std::thread::Builder::new()
        .name("homa-probe-recv".into())
        .spawn(move || {
            let mut buf = [0u8; 1 << 16];
            while !stop.load(Ordering::Acquire) {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        if let Some(packet) = Packet::parse(&buf[..n]) {
                            transport.receive(packet.common().dst_port, from.ip(), &buf[..n], None);
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
                    Err(err) => tracing::warn!(%err, "recv_from failed"),
                }
            }
        })
        .expect("failed to spawn receive loop thread")
}

/// Drives every actor's `now_ns` from a shared `Instant` epoch. Not required
/// for resend/timeout correctness (`timer.rs` counts ticks, not wall-clock
/// deltas) but matches the "a real binary stamps this from CLOCK_MONOTONIC"
/// contract `transport.rs` documents for its clock field.
fn spawn_clock(transports: Vec<Arc<Transport<UdpIp>>>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("homa-probe-clock".into())
        .spawn(move || {
            let epoch = Instant::now();
            while !stop.load(Ordering::Acquire) {
                let now_ns = epoch.elapsed().as_nanos() as u64;
                for transport in &transports {
                    transport.set_now_ns(now_ns);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        })
        .expect("failed to spawn clock thread")
}

struct Actor {
    transport: Arc<Transport<UdpIp>>,
    socket: Arc<Socket>,
    ip: Arc<UdpIp>,
    recv_handle: JoinHandle<()>,
}

fn open_actor(
    config: &HomaConfig,
    local: SocketAddr,
    peer: SocketAddr,
    homa_port: u16,
    rcvbuf: usize,
    stop: Arc<AtomicBool>,
) -> Result<Actor> {
    let socket = UdpSocket::bind(local).with_context(|| format!("failed to bind {local}"))?;
    let recv_socket = socket.try_clone().context("failed to clone udp socket for receive loop")?;
    let ip = Arc::new(UdpIp::new(socket, peer));
    let transport = Transport::new(0, config.clone(), ip.clone());
    let _ = transport.start();
    let recv_handle = spawn_receive_loop(recv_socket, transport.clone(), stop);
    let homa_socket = transport.open(homa_port)?;
    homa_socket.set_rcvbuf(rcvbuf)?;
    Ok(Actor { transport, socket: homa_socket, ip, recv_handle })
}

fn close_actor(actor: Actor, stop: &Arc<AtomicBool>) {
    stop.store(true, Ordering::Release);
    actor.transport.shutdown();
    let _ = actor.recv_handle.join();
}

/// Scenario: a client sends a request, a server answers it, and the
/// completion cookie and lengths round-trip intact.
fn scenario_request_response(config: &HomaConfig) -> Result<String> {
    let stop = Arc::new(AtomicBool::new(false));
    let client_addr: SocketAddr = "127.0.0.1:19101".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.2:19101".parse().unwrap();

    let client = open_actor(config, client_addr, server_addr, 0, 1 << 20, stop.clone())?;
    let server = open_actor(config, server_addr, client_addr, 9000, 1 << 20, stop.clone())?;

    let peer = client.transport.peers().find_or_create(0, server_addr.ip(), client.transport.now_ns());
    let request_id = client
        .transport
        .send(&client.socket, Some((peer, 9000)), 0, Bytes::from(vec![7u8; 200]), 42, false, false)
        .context("client send failed")?;
    anyhow::ensure!(homa::id::is_client_id(request_id), "allocated id {request_id:#x} should be client-role");

    let request = recv_blocking(&server.socket, None, server.transport.now_ns())?;
    anyhow::ensure!(request.length == 200, "server saw request length {}", request.length);
    anyhow::ensure!(
        request.id == homa::id::mirror(request_id),
        "server-side id {:#x} should mirror client id {:#x}",
        request.id,
        request_id
    );

    server
        .transport
        .send(&server.socket, None, request.id, Bytes::from(vec![9u8; 500]), 0, false, false)
        .context("server response send failed")?;

    let response = recv_blocking(&client.socket, Some(request_id), client.transport.now_ns())?;
    anyhow::ensure!(response.length == 500, "client saw response length {}", response.length);
    anyhow::ensure!(
        response.completion_cookie == 42,
        "completion cookie {} did not round-trip",
        response.completion_cookie
    );

    close_actor(client, &stop);
    close_actor(server, &stop);
    Ok(format!("request/response round-tripped: id {request_id:#x}, 200 bytes out, 500 bytes back"))
}

/// Scenario: a message bigger than `unsched_bytes` is carried by a mix
/// of an unscheduled prefix and scheduler-issued grants, and the receiver's
/// grants only ever open forward.
fn scenario_grant_flow(config: &HomaConfig) -> Result<String> {
    let stop = Arc::new(AtomicBool::new(false));
    let client_addr: SocketAddr = "127.0.0.1:19102".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.2:19102".parse().unwrap();

    let mut cfg = config.clone();
    cfg.window = 200_000;

    let client = open_actor(&cfg, client_addr, server_addr, 0, 1 << 21, stop.clone())?;
    let server = open_actor(&cfg, server_addr, client_addr, 9001, 1 << 21, stop.clone())?;

    let message_len = 1_000_000usize;
    let peer = client.transport.peers().find_or_create(0, server_addr.ip(), client.transport.now_ns());
    client
        .transport
        .send(&client.socket, Some((peer, 9001)), 0, Bytes::from(vec![3u8; message_len]), 0, false, false)
        .context("client send failed")?;

    let request = recv_blocking(&server.socket, None, server.transport.now_ns())?;
    anyhow::ensure!(request.length == message_len, "server saw length {} of {message_len}", request.length);

    let data_log = client.ip.take_log();
    let mut offset = 0u32;
    let mut total = 0u32;
    for entry in &data_log {
        if let LoggedPacket::Data { offset: o, length } = *entry {
            anyhow::ensure!(o == offset, "data segments must be contiguous, expected offset {offset}, got {o}");
            offset += length;
            total += length;
        }
    }
    anyhow::ensure!(total as usize == message_len, "data segments summed to {total}, expected {message_len}");

    let grant_log = server.ip.take_log();
    let grant_offsets: Vec<u32> =
        grant_log.iter().filter_map(|e| if let LoggedPacket::Grant { offset } = *e { Some(offset) } else { None }).collect();
    anyhow::ensure!(!grant_offsets.is_empty(), "a message larger than unsched_bytes must receive at least one grant");
    anyhow::ensure!(
        grant_offsets.windows(2).all(|w| w[1] >= w[0]),
        "grant offsets must be monotonically non-decreasing: {grant_offsets:?}"
    );
    anyhow::ensure!(
        grant_offsets[0] > cfg.unsched_bytes,
        "first grant offset {} should extend past the unscheduled prefix {}",
        grant_offsets[0],
        cfg.unsched_bytes
    );

    close_actor(client, &stop);
    close_actor(server, &stop);
    Ok(format!(
        "{message_len} byte message delivered via {} contiguous segments and {} grants",
        data_log.len(),
        grant_offsets.len()
    ))
}

/// Scenario: a single DATA segment is dropped in flight; the timer's
/// RESEND/missing-range logic recovers it without the application noticing
/// anything beyond a longer wait.
fn scenario_packet_loss(config: &HomaConfig) -> Result<String> {
    let stop = Arc::new(AtomicBool::new(false));
    let client_addr: SocketAddr = "127.0.0.1:19103".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.2:19103".parse().unwrap();

    let mut cfg = config.clone();
    // Sized so the receiver's single autonomous grant covers the message's
    // entire remainder in one shot: `update_grant` clamps the offset to
    // `length`, so no ungranted-but-not-yet-sent tail is left over for
    // `Reassembly::missing_ranges` to misreport as "missing" alongside the
    // genuine gap this scenario creates.
    cfg.window = 240_000;
    cfg.resend_ticks = 5;
    cfg.resend_interval = 2;
    cfg.timeout_resends = 10;

    let client = open_actor(&cfg, client_addr, server_addr, 0, 1 << 21, stop.clone())?;
    let server = open_actor(&cfg, server_addr, client_addr, 9002, 1 << 21, stop.clone())?;

    let message_len = 300_000usize;
    let dropped_offset = cfg.unsched_bytes;
    // Armed before the send that will eventually produce a segment at this
    // offset, to avoid a race against the background receive-loop thread
    // acting on the autonomous GRANT before the drop is in place.
    client.ip.drop_once_at(dropped_offset);

    let peer = client.transport.peers().find_or_create(0, server_addr.ip(), client.transport.now_ns());
    client
        .transport
        .send(&client.socket, Some((peer, 9002)), 0, Bytes::from(vec![5u8; message_len]), 0, false, false)
        .context("client send failed")?;

    let request = recv_blocking(&server.socket, None, server.transport.now_ns())?;
    anyhow::ensure!(
        request.length == message_len,
        "message should complete at {message_len} bytes despite the dropped segment, got {}",
        request.length
    );

    close_actor(client, &stop);
    close_actor(server, &stop);
    Ok(format!(
        "{message_len} byte message completed after losing and recovering the segment at offset {dropped_offset}"
    ))
}

/// Scenario: the peer never answers at all. The client's RPC stalls
/// waiting on a response it will never see, gets RESENT to at
/// `resend_interval` spacing, and aborts with a timeout once
/// `timeout_resends` go unanswered.
fn scenario_peer_death(config: &HomaConfig) -> Result<String> {
    let stop = Arc::new(AtomicBool::new(false));
    let client_addr: SocketAddr = "127.0.0.1:19104".parse().unwrap();
    let dead_addr: SocketAddr = "127.0.0.2:19104".parse().unwrap();

    // A receiver gone silent, not a closed port an ICMP would report:
    // reserve the address so the datagram lands somewhere, and never read
    // from it.
    let _dead_socket = UdpSocket::bind(dead_addr).with_context(|| format!("failed to bind {dead_addr}"))?;

    let mut cfg = config.clone();
    cfg.resend_ticks = 3;
    cfg.resend_interval = 2;
    cfg.timeout_resends = 3;

    let client = open_actor(&cfg, client_addr, dead_addr, 0, 1 << 16, stop.clone())?;
    let clock = spawn_clock(vec![client.transport.clone()], stop.clone());

    let peer = client.transport.peers().find_or_create(0, dead_addr.ip(), client.transport.now_ns());
    let id = client
        .transport
        .send(&client.socket, Some((peer.clone(), 9003)), 0, Bytes::from(vec![1u8; 50]), 0, false, false)
        .context("client send failed")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let result = loop {
        match client.socket.recvmsg(&[], Some(id), true, None, client.transport.now_ns()) {
            Ok(result) => break result,
            Err(Error::WouldBlock) => {
                anyhow::ensure!(Instant::now() < deadline, "rpc never timed out within the deadline");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(err) => return Err(err.into()),
        }
    };
    let error = result.error.ok_or_else(|| anyhow::anyhow!("expected the rpc to complete with an error"))?;
    anyhow::ensure!(matches!(error, Error::TimedOut(_)), "expected TimedOut, got {error:?}");
    anyhow::ensure!(peer.is_suspect(), "a peer that never answers should be marked suspect");

    close_actor(client, &stop);
    let _ = clock.join();
    Ok(format!("rpc {id:#x} timed out after {} resends against an unresponsive peer", cfg.timeout_resends))
}

/// Scenario: two sockets in the same namespace cannot bind the same
/// explicit port, but a default-port allocation afterward is unaffected.
fn scenario_port_collision(config: &HomaConfig) -> Result<String> {
    struct NullIp;
    impl homa::IpSend for NullIp {
        fn send(&self, _namespace: u32, _dest: PeerKey, _dest_port: u16, _src_port: u16, _packet: &Packet) {}
    }

    let transport = Transport::new(0, config.clone(), Arc::new(NullIp));
    let first = transport.open(100).context("first explicit-port open should succeed")?;
    let second = transport.open(100);
    anyhow::ensure!(
        matches!(second, Err(Error::AddrInUse(100))),
        "second open on the same explicit port should fail with AddrInUse, got {second:?}"
    );
    let third = transport.open(0).context("default-port allocation should still succeed after the collision")?;
    anyhow::ensure!(third.port() != first.port(), "default-port allocation returned the colliding port");

    Ok(format!("port 100 collision rejected; default allocation still handed out port {}", third.port()))
}

/// Scenario: a blocked `recvmsg` and a concurrent `shutdown` don't
/// race each other into a hang; the blocked call wakes with `ESHUTDOWN` and
/// anything afterward observes the same.
fn scenario_shutdown_race(config: &HomaConfig) -> Result<String> {
    let stop = Arc::new(AtomicBool::new(false));
    let addr: SocketAddr = "127.0.0.1:19106".parse().unwrap();
    let other: SocketAddr = "127.0.0.2:19106".parse().unwrap();
    let actor = open_actor(config, addr, other, 0, 1 << 16, stop.clone())?;

    let socket = actor.socket.clone();
    let blocked = std::thread::Builder::new()
        .name("homa-probe-shutdown-race".into())
        .spawn(move || socket.recvmsg(&[], None, false, None, 0))
        .expect("failed to spawn blocked recv thread");

    std::thread::sleep(Duration::from_millis(50));
    actor.transport.shutdown();

    let result = blocked.join().expect("blocked recv thread panicked");
    anyhow::ensure!(
        matches!(result, Err(Error::Shutdown)),
        "blocked recvmsg should wake with Shutdown, got {result:?}"
    );

    let send_after = actor.transport.send(&actor.socket, None, 0, Bytes::new(), 0, false, true);
    anyhow::ensure!(
        matches!(send_after, Err(Error::Shutdown)),
        "send after shutdown should fail with Shutdown, got {send_after:?}"
    );

    close_actor(actor, &stop);
    Ok("blocked recvmsg and a concurrent shutdown resolved cleanly with ESHUTDOWN".to_string())
}

fn recv_blocking(socket: &Arc<Socket>, want_id: Option<u64>, now_ns: u64) -> Result<homa::RecvResult> {
    socket.recvmsg(&[], want_id, false, None, now_ns).context("recvmsg failed")
}

struct ScenarioSpec {
    name: &'static str,
    run: fn(&HomaConfig) -> Result<String>,
}

const SCENARIOS: &[ScenarioSpec] = &[
    ScenarioSpec { name: "request_response", run: scenario_request_response },
    ScenarioSpec { name: "grant_flow", run: scenario_grant_flow },
    ScenarioSpec { name: "packet_loss", run: scenario_packet_loss },
    ScenarioSpec { name: "peer_death", run: scenario_peer_death },
    ScenarioSpec { name: "port_collision", run: scenario_port_collision },
    ScenarioSpec { name: "shutdown_race", run: scenario_shutdown_race },
];

#[derive(Serialize)]
struct ScenarioOutcome {
    name: String,
    passed: bool,
    detail: String,
    duration_ms: u64,
}

#[derive(Serialize)]
struct ScenarioReport {
    passed: usize,
    failed: usize,
    scenarios: Vec<ScenarioOutcome>,
}

/// Runs every registered scenario, writes a JSON report to `output` (or
/// stdout), and fails the process if any scenario failed: per-item
/// `eprintln!` progress, a JSON report written to a file-or-stdout, a final
/// summary line.
pub fn run_all(config: &HomaConfig, output: Option<PathBuf>) -> Result<()> {
    let mut outcomes = Vec::with_capacity(SCENARIOS.len());
    for spec in SCENARIOS {
        eprintln!("running {}...", spec.name);
        let started = Instant::now();
        let outcome = match (spec.run)(config) {
            Ok(detail) => ScenarioOutcome {
                name: spec.name.to_string(),
                passed: true,
                detail,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(err) => ScenarioOutcome {
                name: spec.name.to_string(),
                passed: false,
                detail: format!("{err:#}"),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        };
        eprintln!("  {} ({} ms): {}", if outcome.passed { "PASS" } else { "FAIL" }, outcome.duration_ms, outcome.detail);
        outcomes.push(outcome);
    }

    let passed = outcomes.iter().filter(|o| o.passed).count();
    let failed = outcomes.len() - passed;
    let report = ScenarioReport { passed, failed, scenarios: outcomes };
    let json = serde_json::to_string_pretty(&report).context("failed to serialize scenario report")?;

    match output {
        Some(path) => std::fs::write(&path, &json).with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{json}"),
    }

    eprintln!("\n{} passed, {} failed", report.passed, report.failed);
    anyhow::ensure!(report.failed == 0, "{} scenario(s) failed", report.failed);
    Ok(())
}
