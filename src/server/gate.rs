// Admission gate between client requests and maintenance.
//
// Requests hold a `Pass` while they run. Maintenance closes the gate,
// which stops new passes from being issued, and waits for the in-flight
// count to reach zero before it touches any bucket.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct AdmissionGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Held by one in-flight request.
pub(crate) struct Pass<'a> {
    gate: &'a AdmissionGate,
}

/// Held by maintenance; reopens the gate on drop.
pub(crate) struct Closed<'a> {
    gate: &'a AdmissionGate,
}

impl AdmissionGate {
    /// Wait until the gate is open and register one request.
    pub(crate) fn enter(&self) -> Pass<'_> {
        let mut state = self.state.lock();
        while state.closed {
            self.changed.wait(&mut state);
        }
        state.in_flight += 1;
        Pass { gate: self }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stop admitting requests and wait for in-flight ones to finish.
    pub(crate) fn close_and_drain(&self) -> Closed<'_> {
        let mut state = self.state.lock();
        while state.closed {
            self.changed.wait(&mut state);
        }
        state.closed = true;
        if state.in_flight > 0 {
            log::info!(
                "waiting for {} request(s) to finish before maintenance",
                state.in_flight
            );
        }
        while state.in_flight > 0 {
            self.changed.wait(&mut state);
        }
        Closed { gate: self }
    }
}

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.changed.notify_all();
        }
    }
}

impl Drop for Closed<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().closed = false;
        self.gate.changed.notify_all();
    }
}
