//! The two process-wide events from the operator surface (§6):
//! `flow_event` and `overlay_event`. External observers block on
//! `wait_since` to wake whenever the kernel reports a state change,
//! without polling.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Event {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    pub fn current(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn fire(&self) {
        let mut gen = self.generation.lock();
        *gen += 1;
        self.condvar.notify_all();
    }

    /// Blocks until the generation advances past `since`, returning the
    /// new generation.
    pub fn wait_since(&self, since: u64) -> u64 {
        let mut gen = self.generation.lock();
        while *gen <= since {
            self.condvar.wait(&mut gen);
        }
        *gen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_since_wakes_on_fire() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_since(0))
        };
        thread::sleep(Duration::from_millis(20));
        event.fire();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
