//! One-shot barrier released when cluster membership reaches a target.
//!
//! Membership events arrive on a channel drained by a dedicated listener
//! thread. Once released the gate stays released: later events, including
//! members leaving, do not re-arm it.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use holo_cache::cluster::MembershipEvent;
use tokio::sync::mpsc::UnboundedReceiver;

/// Released once the cluster reaches `target` members.
pub struct ConvergenceGate {
    target: usize,
    released: Mutex<bool>,
    cond: Condvar,
}

impl ConvergenceGate {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            released: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Feed one event. Returns true only for the event that released the gate.
    pub fn observe(&self, event: &MembershipEvent) -> bool {
        if event.is_pre() || event.members < self.target {
            return false;
        }
        self.release()
    }

    /// Release unconditionally. Returns false if already released.
    pub fn release(&self) -> bool {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        if *released {
            return false;
        }
        *released = true;
        self.cond.notify_all();
        true
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until released. There is no timeout.
    pub fn wait(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            released = self
                .cond
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until released or `timeout` elapses; true when released.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(released, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            released = guard;
        }
        true
    }

    /// Drain `events` into the gate on a named thread. The thread exits when
    /// the channel closes.
    pub fn spawn_listener(
        gate: Arc<Self>,
        mut events: UnboundedReceiver<MembershipEvent>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("topology-listener".to_string())
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    tracing::debug!(
                        pre = event.is_pre(),
                        members = event.members,
                        change = ?event.change,
                        "membership event"
                    );
                    if gate.observe(&event) {
                        tracing::info!(
                            members = event.members,
                            target = gate.target,
                            "cluster converged"
                        );
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_cache::cluster::{ChangePhase, MembershipChange};

    fn event(phase: ChangePhase, members: usize) -> MembershipEvent {
        MembershipEvent {
            phase,
            members,
            change: MembershipChange::Joined(members as u64),
        }
    }

    #[test]
    fn releases_exactly_once_at_target() {
        let gate = ConvergenceGate::new(3);
        let sizes = [1, 2, 3, 4, 2, 3];
        let releases: Vec<bool> = sizes
            .iter()
            .map(|&n| gate.observe(&event(ChangePhase::Post, n)))
            .collect();
        assert_eq!(releases, vec![false, false, true, false, false, false]);
        assert!(gate.is_released());
    }

    #[test]
    fn pre_events_are_ignored() {
        let gate = ConvergenceGate::new(2);
        assert!(!gate.observe(&event(ChangePhase::Pre, 2)));
        assert!(!gate.is_released());
        assert!(gate.observe(&event(ChangePhase::Post, 2)));
    }

    #[test]
    fn listener_thread_releases_waiters() {
        let gate = Arc::new(ConvergenceGate::new(2));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let listener = ConvergenceGate::spawn_listener(gate.clone(), rx).unwrap();

        tx.send(event(ChangePhase::Post, 1)).unwrap();
        assert!(!gate.wait_for(Duration::from_millis(50)));

        tx.send(event(ChangePhase::Pre, 2)).unwrap();
        tx.send(event(ChangePhase::Post, 2)).unwrap();
        gate.wait();
        assert!(gate.is_released());

        drop(tx);
        listener.join().unwrap();
    }
}
