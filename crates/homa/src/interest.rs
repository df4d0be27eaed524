//! Interest / wait.
//!
//! An `Interest` is how an application thread blocks in `recv`: it either
//! waits on any non-private ready RPC (shared) or on one specific RPC
//! (private). The handoff protocol below runs from the incoming engine or
//! timer thread when a message completes or an RPC is aborted, and must
//! never race a waiter unlinking itself — the `ready` flag, set under the
//! same mutex the waiter polls, is the single source of truth.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Rpc(u64),
    /// Shutdown woke every waiter with no RPC attached.
    Shutdown,
    /// A future cancellation mechanism (e.g. signal delivery) fired before
    /// this interest claimed an RPC.
    Interrupted,
}

struct Inner {
    ready: bool,
    result: Option<Outcome>,
}

pub struct Interest {
    /// CPU core the waiting thread was last seen on; used by the handoff
    /// protocol's "prefer an idle core" rule.
    pub core: Option<u32>,
    pub created_ns: u64,
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Interest {
    pub fn new(core: Option<u32>, now_ns: u64) -> Arc<Self> {
        Arc::new(Self {
            core,
            created_ns: now_ns,
            inner: Mutex::new(Inner { ready: false, result: None }),
            cv: Condvar::new(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().ready
    }

    fn set(&self, outcome: Outcome) {
        let mut guard = self.inner.lock().unwrap();
        if guard.ready {
            return;
        }
        guard.result = Some(outcome);
        guard.ready = true;
        drop(guard);
        self.cv.notify_all();
    }

    pub fn notify_rpc(&self, id: u64) {
        self.set(Outcome::Rpc(id));
    }

    pub fn notify_shutdown(&self) {
        self.set(Outcome::Shutdown);
    }

    pub fn cancel(&self) {
        self.set(Outcome::Interrupted);
    }

    /// Busy-spin for `poll_usecs`, then either sleep (blocking) or return
    /// `EAGAIN` (non-blocking).
    pub fn wait(&self, poll_usecs: u64, blocking: bool) -> Result<Outcome> {
        let deadline = Instant::now() + Duration::from_micros(poll_usecs);
        loop {
            {
                let guard = self.inner.lock().unwrap();
                if guard.ready {
                    return Ok(guard.result.unwrap());
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::yield_now();
        }
        if !blocking {
            return Err(Error::WouldBlock);
        }
        let guard = self.inner.lock().unwrap();
        let guard = self
            .cv
            .wait_while(guard, |g| !g.ready)
            .expect("interest mutex poisoned");
        match guard.result.unwrap() {
            Outcome::Shutdown => Err(Error::Shutdown),
            Outcome::Interrupted => Err(Error::Interrupted),
            other => Ok(other),
        }
    }
}

/// Handoff on completion of an incoming message or on error. Takes
/// the RPC's private interest (if any), the socket's ready-RPC list, and
/// the socket's shared-interest queue; `reporting_core` is the core running
/// this handoff, used to prefer an idle shared interest.
pub fn handoff(
    rpc_id: u64,
    private: Option<&Arc<Interest>>,
    ready_rpcs: &Mutex<VecDeque<u64>>,
    shared: &Mutex<VecDeque<Arc<Interest>>>,
    reporting_core: Option<u32>,
) {
    if let Some(interest) = private {
        interest.notify_rpc(rpc_id);
        return;
    }

    {
        let ready = ready_rpcs.lock().unwrap();
        if ready.contains(&rpc_id) {
            return;
        }
    }
    ready_rpcs.lock().unwrap().push_back(rpc_id);

    let mut shared_guard = shared.lock().unwrap();
    if shared_guard.is_empty() {
        return;
    }
    let pick_idx = shared_guard
        .iter()
        .position(|i| i.core.is_some() && i.core == reporting_core)
        .unwrap_or(0);
    let interest = shared_guard.remove(pick_idx).unwrap();
    drop(shared_guard);

    let mut ready = ready_rpcs.lock().unwrap();
    if let Some(pos) = ready.iter().position(|&id| id == rpc_id) {
        ready.remove(pos);
    }
    drop(ready);
    interest.notify_rpc(rpc_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_interest_is_notified_directly() {
        let interest = Interest::new(None, 0);
        let ready_rpcs = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::new());
        handoff(5, Some(&interest), &ready_rpcs, &shared, None);
        assert_eq!(interest.wait(0, false).unwrap(), Outcome::Rpc(5));
        assert!(ready_rpcs.lock().unwrap().is_empty());
    }

    #[test]
    fn shared_interest_is_matched_when_waiting() {
        let interest = Interest::new(None, 0);
        let ready_rpcs = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::from(vec![interest.clone()]));
        handoff(7, None, &ready_rpcs, &shared, None);
        assert_eq!(interest.wait(0, false).unwrap(), Outcome::Rpc(7));
        assert!(ready_rpcs.lock().unwrap().is_empty());
        assert!(shared.lock().unwrap().is_empty());
    }

    #[test]
    fn no_waiting_shared_interest_lands_on_ready_list() {
        let ready_rpcs = Mutex::new(VecDeque::new());
        let shared: Mutex<VecDeque<Arc<Interest>>> = Mutex::new(VecDeque::new());
        handoff(9, None, &ready_rpcs, &shared, None);
        assert_eq!(ready_rpcs.lock().unwrap().front(), Some(&9));
    }

    #[test]
    fn shutdown_wakes_waiter_with_esshutdown() {
        let interest = Interest::new(None, 0);
        interest.notify_shutdown();
        let err = interest.wait(0, true).unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn non_blocking_wait_returns_eagain() {
        let interest = Interest::new(None, 0);
        let err = interest.wait(0, false).unwrap_err();
        assert!(matches!(err, Error::WouldBlock));
    }
}
