//! The ICU registry (§3) and the pure bookkeeping the connection
//! supervisor ("doctor", §4.6) needs: parked neighbours, per-tick
//! countdown decrement, and backoff scheduling. The actual reconnect
//! attempts are driven by `kernel`, which has the sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::id::NodeId;
use crate::scale::ScalingCurve;

#[derive(Clone, Debug)]
pub struct IcuEntry {
    pub control_addr: SocketAddr,
    pub flow_addr: SocketAddr,
    pub name: Option<String>,
    pub health: u32,
    pub attempt_index: u32,
    pub countdown: u32,
}

/// The parked set of once-connected neighbours awaiting reconnection,
/// condition-protected so the supervisor can sleep when it's empty
/// (§5 suspension points) instead of busy-polling.
#[derive(Default)]
pub struct Icu {
    inner: Mutex<HashMap<NodeId, IcuEntry>>,
    condvar: Condvar,
}

impl Icu {
    pub fn new() -> Icu {
        Icu::default()
    }

    /// Parks a neighbour whose control link just died. It gets one
    /// immediate countdown tick before the first reconnect attempt.
    pub fn park(
        &self,
        id: NodeId,
        control_addr: SocketAddr,
        flow_addr: SocketAddr,
        name: Option<String>,
        initial_health: u32,
    ) {
        let mut inner = self.inner.lock();
        inner.insert(
            id,
            IcuEntry {
                control_addr,
                flow_addr,
                name,
                health: initial_health,
                attempt_index: 0,
                countdown: 1,
            },
        );
        self.condvar.notify_all();
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Removes a neighbour unconditionally (operator `forget`, or a
    /// successful reconnect discharging it).
    pub fn discard(&self, id: &NodeId) -> Option<IcuEntry> {
        self.inner.lock().remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Decrements every countdown by one tick and returns (removing)
    /// those that reached zero — due for a reconnect attempt this round.
    pub fn tick(&self) -> Vec<(NodeId, IcuEntry)> {
        let mut inner = self.inner.lock();
        let due: Vec<NodeId> = inner
            .iter_mut()
            .filter_map(|(id, entry)| {
                entry.countdown = entry.countdown.saturating_sub(1);
                if entry.countdown == 0 {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect();
        due.into_iter().filter_map(|id| inner.remove(&id).map(|e| (id, e))).collect()
    }

    /// After a failed reconnect attempt: decrements health and, if any
    /// remains, re-parks with the next backoff delay; otherwise the
    /// neighbour is discarded entirely. Returns `true` if re-parked.
    pub fn requeue_after_failure(&self, id: NodeId, mut entry: IcuEntry, period: Duration, curve: ScalingCurve) -> bool {
        entry.health = entry.health.saturating_sub(1);
        if entry.health == 0 {
            return false;
        }
        let delay = curve.next_delay(period, entry.attempt_index);
        entry.attempt_index += 1;
        entry.countdown = ((delay.as_secs_f64() / period.as_secs_f64()).ceil() as u32).max(1);
        self.inner.lock().insert(id, entry);
        true
    }

    /// Blocks until the ICU is non-empty, waking at least every
    /// `max_wait` so the supervisor can still observe `stop`.
    pub fn wait_nonempty(&self, max_wait: Duration) {
        let mut inner = self.inner.lock();
        if inner.is_empty() {
            self.condvar.wait_for(&mut inner, max_wait);
        }
    }

    /// Wakes anyone blocked in `wait_nonempty` without changing the map,
    /// used to unstick the supervisor on shutdown.
    pub fn notify(&self) {
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn tick_returns_entries_whose_countdown_expired() {
        let icu = Icu::new();
        let id = NodeId::generate();
        icu.park(id, addr(), addr(), None, 3);
        let due = icu.tick();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, id);
        assert!(icu.is_empty());
    }

    #[test]
    fn requeue_discards_after_health_depleted() {
        let icu = Icu::new();
        let id = NodeId::generate();
        let entry = IcuEntry {
            control_addr: addr(),
            flow_addr: addr(),
            name: None,
            health: 1,
            attempt_index: 0,
            countdown: 0,
        };
        let requeued = icu.requeue_after_failure(id, entry, Duration::from_secs(1), ScalingCurve::Constant);
        assert!(!requeued);
        assert!(!icu.contains(&id));
    }

    #[test]
    fn requeue_keeps_neighbour_while_health_remains() {
        let icu = Icu::new();
        let id = NodeId::generate();
        let entry = IcuEntry {
            control_addr: addr(),
            flow_addr: addr(),
            name: None,
            health: 3,
            attempt_index: 0,
            countdown: 0,
        };
        let requeued = icu.requeue_after_failure(id, entry, Duration::from_secs(1), ScalingCurve::Exponential);
        assert!(requeued);
        assert!(icu.contains(&id));
    }
}
