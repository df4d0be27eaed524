//! Socket.
//!
//! `Socket` is the syscall boundary: `sendmsg`/`recvmsg`/`bind`/`shutdown`/
//! `poll` validate arguments and manipulate an RPC the way a request/
//! response method surface would, rather than running its own thread —
//! `transport.rs` owns the background threads this socket's state feeds
//! into and drains from. Blocking lives here too: `sendmsg` waits on
//! send-memory the same way `recvmsg` waits on an `Interest`, both honoring
//! a non-blocking flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use bytes::Bytes;

use crate::config::HomaConfig;
use crate::error::{Error, Result};
use crate::grant::GrantScheduler;
use crate::interest::{handoff, Interest, Outcome};
use crate::outgoing::{validate_response_send, OutgoingMessage, ResponseSendOutcome};
use crate::peer::{Peer, PeerKey, PeerTable};
use crate::pool::BufferPool;
use crate::rpc::{Rpc, RpcHandle, RpcState, RpcTable};

struct SendMemory {
    used: usize,
    capacity: usize,
}

/// What `recvmsg` hands back to the caller on success.
#[derive(Debug)]
pub struct RecvResult {
    pub id: u64,
    pub completion_cookie: u64,
    pub sender: PeerKey,
    pub sender_port: u16,
    pub bpages: Vec<usize>,
    pub length: usize,
    pub error: Option<Error>,
}

pub struct Socket {
    pub namespace: u32,
    port: Mutex<u16>,
    is_server: AtomicBool,
    shutdown: AtomicBool,
    config: HomaConfig,
    peers: Arc<PeerTable>,
    grant: Arc<GrantScheduler>,
    pub rpcs: RpcTable,
    pool: OnceLock<BufferPool>,
    pub ready_rpcs: Mutex<VecDeque<u64>>,
    pub shared_interests: Mutex<VecDeque<Arc<Interest>>>,
    send_mem: Mutex<SendMemory>,
    send_cv: Condvar,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("namespace", &self.namespace)
            .field("port", &self.port)
            .field("is_server", &self.is_server)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl Socket {
    pub fn new(
        namespace: u32,
        port: u16,
        config: HomaConfig,
        peers: Arc<PeerTable>,
        grant: Arc<GrantScheduler>,
    ) -> Self {
        let rpc_buckets = config.rpc_buckets;
        let capacity = config.send_mem_bytes;
        Self {
            namespace,
            port: Mutex::new(port),
            is_server: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            config,
            peers,
            grant,
            rpcs: RpcTable::new(rpc_buckets),
            pool: OnceLock::new(),
            ready_rpcs: Mutex::new(VecDeque::new()),
            shared_interests: Mutex::new(VecDeque::new()),
            send_mem: Mutex::new(SendMemory { used: 0, capacity }),
            send_cv: Condvar::new(),
        }
    }

    pub fn port(&self) -> u16 {
        *self.port.lock().unwrap()
    }

    pub fn set_port(&self, port: u16) {
        *self.port.lock().unwrap() = port;
    }

    /// `bind`: a port at or above `MIN_DEFAULT_PORT` is invalid, port 0 is a
    /// no-op, otherwise reassigns. Only validates the port number itself —
    /// the caller (`Transport`) is responsible for moving the `SocketTable`
    /// entry and reporting `EADDRINUSE`.
    pub fn validate_bind_port(port: u16) -> Result<Option<u16>> {
        if port == 0 {
            return Ok(None);
        }
        if port >= crate::config::MIN_DEFAULT_PORT {
            return Err(Error::InvalidArgument(
                "explicit bind port must be below the default-port floor".into(),
            ));
        }
        Ok(Some(port))
    }

    pub fn set_server(&self, server: bool) {
        self.is_server.store(server, Ordering::Release);
    }

    pub fn is_server(&self) -> bool {
        self.is_server.load(Ordering::Acquire)
    }

    /// Sets the receive-buffer region backing this socket. Once per socket.
    pub fn set_rcvbuf(&self, region_len: usize) -> Result<()> {
        self.pool
            .set(BufferPool::new(region_len, &self.config))
            .map_err(|_| Error::InvalidArgument("SO_HOMA_RCVBUF already set".into()))
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.get()
    }

    pub fn config(&self) -> &HomaConfig {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wakes every waiter with `ESHUTDOWN` and marks the socket so further
    /// `send`/`recv` fail the same way. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut shared = self.shared_interests.lock().unwrap();
        for interest in shared.drain(..) {
            interest.notify_shutdown();
        }
        drop(shared);
        self.send_cv.notify_all();
    }

    /// `EPOLLIN`-equivalent: ready when `ready_rpcs` is non-empty or the
    /// socket is shut down.
    pub fn poll_readable(&self) -> bool {
        self.is_shutdown() || !self.ready_rpcs.lock().unwrap().is_empty()
    }

    pub fn poll_writable(&self) -> bool {
        let mem = self.send_mem.lock().unwrap();
        mem.used < mem.capacity
    }

    fn acquire_send_mem(&self, bytes: usize, non_blocking: bool) -> Result<()> {
        let mut mem = self.send_mem.lock().unwrap();
        loop {
            if self.is_shutdown() {
                return Err(Error::Shutdown);
            }
            if mem.used + bytes <= mem.capacity || mem.used == 0 {
                // A message larger than the whole pool is still admitted if
                // nothing else is outstanding, the same all-or-nothing
                // allow-one-big-one rule `pool.rs` takes for bpage leases.
                mem.used += bytes;
                return Ok(());
            }
            if non_blocking {
                return Err(Error::WouldBlock);
            }
            mem = self.send_cv.wait(mem).expect("send-memory mutex poisoned");
        }
    }

    fn release_send_mem(&self, bytes: usize) {
        let mut mem = self.send_mem.lock().unwrap();
        mem.used = mem.used.saturating_sub(bytes);
        drop(mem);
        self.send_cv.notify_one();
    }

    /// Validates arguments fully before any allocation, then either
    /// creates a client RPC (`id == 0`) or queues a response for an
    /// existing `IN_SERVICE` server RPC.
    #[allow(clippy::too_many_arguments)]
    pub fn sendmsg(
        &self,
        local_port: u16,
        dest: Option<(Arc<Peer>, u16)>,
        id: u64,
        data: Bytes,
        completion_cookie: u64,
        private: bool,
        non_blocking: bool,
        now_ns: u64,
    ) -> Result<u64> {
        if data.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("message exceeds the 32-bit length field".into()));
        }
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        if id == 0 && dest.is_none() {
            return Err(Error::InvalidArgument("id == 0 requires a destination address".into()));
        }

        let len = data.len();
        self.acquire_send_mem(len, non_blocking)?;

        let handle = if id == 0 {
            let (peer, remote_port) = dest.expect("validated above");
            self.rpcs.alloc_client(peer, remote_port, now_ns)
        } else {
            let found = self.rpcs.find_server_by_id(id).map(|h| {
                let rpc = h.lock().unwrap();
                !rpc.is_client && rpc.state == RpcState::InService
            });
            match validate_response_send(found) {
                ResponseSendOutcome::NoOp => {
                    self.release_send_mem(len);
                    return Ok(id);
                }
                ResponseSendOutcome::Invalid => {
                    self.release_send_mem(len);
                    return Err(Error::InvalidArgument(
                        "id does not name an in-service server rpc on this socket".into(),
                    ));
                }
                ResponseSendOutcome::Ok => {
                    self.rpcs.find_server_by_id(id).expect("checked Ok above")
                }
            }
        };

        let out_id = {
            let mut rpc = handle.lock().unwrap();
            rpc.outgoing = Some(OutgoingMessage::new(data, self.config.unsched_bytes));
            rpc.completion_cookie = completion_cookie;
            rpc.private = private;
            if !rpc.is_client {
                rpc.state = RpcState::Outgoing;
            }
            rpc.id
        };
        let _ = local_port;
        Ok(out_id)
    }

    /// Returns previously-received bpages first, then blocks (or fails
    /// `EAGAIN`) until a message this call is eligible for is ready.
    /// `want_id`, when set, implements the `PRIVATE`-flag id-specific wait;
    /// otherwise any ready RPC on `ready_rpcs` satisfies the call.
    pub fn recvmsg(
        &self,
        returned_bpages: &[usize],
        want_id: Option<u64>,
        non_blocking: bool,
        core: Option<u32>,
        now_ns: u64,
    ) -> Result<RecvResult> {
        if let Some(pool) = self.pool() {
            pool.release(returned_bpages);
            if !returned_bpages.is_empty() {
                crate::incoming::retry_waiting(&self.rpcs, pool, core.unwrap_or(0), now_ns);
            }
        }
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let id = match want_id {
            Some(id) => self.wait_for_private(id, non_blocking, core, now_ns)?,
            None => self.wait_for_shared(non_blocking, core, now_ns)?,
        };
        self.take_result(id)
    }

    fn wait_for_private(
        &self,
        id: u64,
        non_blocking: bool,
        core: Option<u32>,
        now_ns: u64,
    ) -> Result<u64> {
        let handle = self.find_any(id).ok_or(Error::UnknownRpc(id))?;
        if ready_to_deliver(&handle.lock().unwrap()) {
            return Ok(id);
        }
        let interest = Interest::new(core, now_ns);
        {
            let mut rpc = handle.lock().unwrap();
            if ready_to_deliver(&rpc) {
                return Ok(id);
            }
            rpc.private_interest = Some(interest.clone());
        }
        match interest.wait(self.config.poll_usecs, !non_blocking)? {
            Outcome::Rpc(id) => Ok(id),
            Outcome::Shutdown => Err(Error::Shutdown),
            Outcome::Interrupted => Err(Error::Interrupted),
        }
    }

    fn wait_for_shared(&self, non_blocking: bool, core: Option<u32>, now_ns: u64) -> Result<u64> {
        if let Some(id) = self.ready_rpcs.lock().unwrap().pop_front() {
            return Ok(id);
        }
        let interest = Interest::new(core, now_ns);
        self.shared_interests.lock().unwrap().push_back(interest.clone());
        match interest.wait(self.config.poll_usecs, !non_blocking)? {
            Outcome::Rpc(id) => Ok(id),
            Outcome::Shutdown => Err(Error::Shutdown),
            Outcome::Interrupted => Err(Error::Interrupted),
        }
    }

    fn find_any(&self, id: u64) -> Option<RpcHandle> {
        if crate::id::is_client_id(id) {
            self.rpcs.find_client(id)
        } else {
            self.rpcs.find_server_by_id(id)
        }
    }

    /// Look up any RPC this socket owns by id alone — `Transport` uses this
    /// to resolve the socket/RPC pair a pending pacer packet or ack belongs
    /// to without needing its own parallel index.
    pub fn find_rpc(&self, id: u64) -> Option<RpcHandle> {
        self.find_any(id)
    }

    fn take_result(&self, id: u64) -> Result<RecvResult> {
        let handle = self.find_any(id).ok_or(Error::UnknownRpc(id))?;
        let mut rpc = handle.lock().unwrap();
        let bpages = std::mem::take(&mut rpc.bpages);
        let length = rpc.incoming.as_ref().map(|r| r.length() as usize).unwrap_or(0);
        let error = rpc.error.take();
        let result = RecvResult {
            id: rpc.id,
            completion_cookie: rpc.completion_cookie,
            sender: rpc.peer.key,
            sender_port: rpc.remote_port,
            bpages,
            length,
            error,
        };
        let is_dead = rpc.is_dead();
        let sent_len = rpc.outgoing.as_ref().map(|o| o.length as usize);
        drop(rpc);
        if let Some(sent_len) = sent_len {
            self.release_send_mem(sent_len);
        }
        if is_dead {
            let server_key = if crate::id::is_client_id(id) { None } else { Some((result.sender, id)) };
            self.rpcs.schedule_reap(crate::id::is_client_id(id), id, server_key);
        }
        Ok(result)
    }

    /// Route a completed incoming message's wakeup through this socket's
    /// own lists — called by the incoming engine / timer with the socket
    /// already resolved from the socket table.
    pub fn notify_ready(&self, rpc_id: u64, private: Option<&Arc<Interest>>, core: Option<u32>) {
        handoff(rpc_id, private, &self.ready_rpcs, &self.shared_interests, core);
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn grant(&self) -> &Arc<GrantScheduler> {
        &self.grant
    }

    /// `ioctl(HOMAIOCABORT, {id, error})` with a nonzero id: moves the named
    /// RPC to `Dead` with `err` attached, making it visible to the next
    /// matching `recv`, and wakes whichever interest — private or shared —
    /// is waiting on it. A no-op if the RPC is already dead.
    pub fn abort(&self, id: u64, err: Error) -> Result<()> {
        let handle = self.find_any(id).ok_or(Error::UnknownRpc(id))?;
        let private = {
            let mut rpc = handle.lock().unwrap();
            if rpc.is_dead() {
                return Ok(());
            }
            rpc.abort(err);
            rpc.private_interest.clone()
        };
        self.notify_ready(id, private.as_ref(), None);
        Ok(())
    }

    /// `ioctl(HOMAIOCABORT, {id: 0, error})`: the socket-wide form of abort,
    /// ending every client RPC this socket owns with `err`. Server-role
    /// RPCs (responses this socket still owes) are untouched.
    pub fn abort_all_client_rpcs(&self, err: Error) {
        for id in self.rpcs.client_ids() {
            let _ = self.abort(id, err.clone());
        }
    }
}

fn ready_to_deliver(rpc: &Rpc) -> bool {
    rpc.is_dead() || (!rpc.is_client && rpc.state == RpcState::InService)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn socket() -> (Socket, Arc<PeerTable>) {
        let config = HomaConfig::default();
        let peers = Arc::new(PeerTable::new(&config));
        let grant = Arc::new(GrantScheduler::new(&config));
        (Socket::new(0, 0x8000, config, peers.clone(), grant), peers)
    }

    #[test]
    fn bind_rejects_default_range_and_allows_zero() {
        assert!(Socket::validate_bind_port(crate::config::MIN_DEFAULT_PORT).is_err());
        assert_eq!(Socket::validate_bind_port(0).unwrap(), None);
        assert_eq!(Socket::validate_bind_port(100).unwrap(), Some(100));
    }

    #[test]
    fn sendmsg_requires_destination_for_new_rpc() {
        let (socket, _peers) = socket();
        let err = socket
            .sendmsg(100, None, 0, Bytes::from_static(b"hi"), 0, false, true, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn sendmsg_allocates_client_rpc_and_response_completes_it() {
        let (socket, peers) = socket();
        let peer = peers.find_or_create(0, "10.0.0.1".parse::<IpAddr>().unwrap(), 0);
        let id = socket
            .sendmsg(100, Some((peer, 9000)), 0, Bytes::from_static(b"hello"), 42, false, true, 0)
            .unwrap();
        assert!(crate::id::is_client_id(id));
        assert!(socket.rpcs.find_client(id).is_some());
    }

    #[test]
    fn response_send_to_unknown_id_is_a_noop() {
        let (socket, _peers) = socket();
        let id = socket
            .sendmsg(100, None, 777, Bytes::from_static(b"resp"), 0, false, true, 0)
            .unwrap();
        assert_eq!(id, 777);
    }

    #[test]
    fn response_send_to_not_in_service_rpc_is_invalid() {
        let (socket, peers) = socket();
        let peer = peers.find_or_create(0, "10.0.0.2".parse::<IpAddr>().unwrap(), 0);
        let (handle, _) = socket.rpcs.find_or_create_server(peer, 9000, 5, 0);
        assert_eq!(handle.lock().unwrap().state, RpcState::Incoming);
        let err = socket
            .sendmsg(100, None, 5, Bytes::from_static(b"resp"), 0, false, true, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn shutdown_wakes_shared_waiters_and_is_idempotent() {
        let (socket, _peers) = socket();
        let interest = Interest::new(None, 0);
        socket.shared_interests.lock().unwrap().push_back(interest.clone());
        socket.shutdown();
        socket.shutdown();
        assert!(socket.is_shutdown());
        let err = interest.wait(0, true).unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn recvmsg_on_shutdown_socket_fails() {
        let (socket, _peers) = socket();
        socket.shutdown();
        let err = socket.recvmsg(&[], None, true, None, 0).unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn recvmsg_delivers_ready_rpc_from_ready_list() {
        let (socket, peers) = socket();
        let peer = peers.find_or_create(0, "10.0.0.3".parse::<IpAddr>().unwrap(), 0);
        let handle = socket.rpcs.alloc_client(peer, 9000, 0);
        let id;
        {
            let mut rpc = handle.lock().unwrap();
            id = rpc.id;
            rpc.end();
            rpc.completion_cookie = 99;
        }
        socket.ready_rpcs.lock().unwrap().push_back(id);
        let result = socket.recvmsg(&[], None, true, None, 0).unwrap();
        assert_eq!(result.id, id);
        assert_eq!(result.completion_cookie, 99);
    }

    #[test]
    fn poll_writable_reflects_send_memory() {
        let (socket, _peers) = socket();
        assert!(socket.poll_writable());
    }
}
