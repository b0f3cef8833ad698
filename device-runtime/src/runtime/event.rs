// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{ErrorKind, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed(String),
}

/// A completion signal of an enqueued command.
///
/// Events are cheap to clone. All clones observe the same status. An event
/// transitions from `Pending` exactly once, either to `Complete` or to
/// `Failed`.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    id: u64,
    state: Mutex<EventState>,
    cond: Condvar,
}

struct EventState {
    status: EventStatus,
    finished_at: Option<Instant>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(EventState {
                    status: EventStatus::Pending,
                    finished_at: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().status.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().status == EventStatus::Complete
    }

    /// The time at which the event left the pending state.
    pub fn finished_at(&self) -> Option<Instant> {
        self.inner.state.lock().finished_at
    }

    pub(crate) fn complete(&self) {
        self.transition(EventStatus::Complete);
    }

    pub(crate) fn fail<S: Into<String>>(&self, msg: S) {
        self.transition(EventStatus::Failed(msg.into()));
    }

    fn transition(&self, next: EventStatus) {
        let mut state = self.inner.state.lock();
        if state.status == EventStatus::Pending {
            state.status = next;
            state.finished_at = Some(Instant::now());
            self.inner.cond.notify_all();
        }
    }

    /// Blocks until the event is no longer pending.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.status == EventStatus::Pending {
            self.inner.cond.wait(&mut state);
        }
        Self::into_result(self.inner.id, &state.status)
    }

    /// Blocks until the event is no longer pending, or the timeout elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.status == EventStatus::Pending {
            let timed_out = self.inner.cond.wait_until(&mut state, deadline).timed_out();
            if timed_out && state.status == EventStatus::Pending {
                return Ok(false);
            }
        }
        Self::into_result(self.inner.id, &state.status).map(|_| true)
    }

    fn into_result(id: u64, status: &EventStatus) -> Result<()> {
        match status {
            EventStatus::Failed(msg) => {
                Err(ErrorKind::RuntimeError(format!("event {} failed: {}", id, msg)).into())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn complete_wakes_waiters() {
        let event = Event::new();
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait())
        };
        event.complete();
        assert!(waiter.join().unwrap().is_ok());
        assert!(event.is_complete());
        assert!(event.finished_at().is_some());
    }

    #[test]
    fn first_transition_wins() {
        let event = Event::new();
        event.fail("boom");
        event.complete();
        assert_eq!(event.status(), EventStatus::Failed("boom".to_string()));
        assert!(event.wait().is_err());
    }

    #[test]
    fn wait_timeout_on_pending() {
        let event = Event::new();
        assert_eq!(event.wait_timeout(Duration::from_millis(10)).unwrap(), false);
    }
}
