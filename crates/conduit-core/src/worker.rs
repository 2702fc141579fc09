//! The cancellable worker abstraction (§4.1): the one concurrency primitive
//! every other active component (service worker, task, socket manager) is
//! built from.
//!
//! The runtime deliberately uses OS threads rather than a cooperative
//! scheduler for this primitive (§5: "the runtime does not use a
//! single-threaded cooperative scheduler"); the socket manager is the single
//! exception, running its own `tokio` reactor inside the one thread this
//! primitive gives it (see `conduit-transport::socket_manager`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::RuntimeError;

struct StopInner {
    flag: AtomicBool,
    gate: Mutex<()>,
    woken: Condvar,
}

/// A cheaply clonable handle a routine uses to observe and react to a stop
/// request. Every clone shares the same underlying flag.
#[derive(Clone)]
pub struct StopToken(Arc<StopInner>);

impl StopToken {
    fn new() -> Self {
        Self(Arc::new(StopInner {
            flag: AtomicBool::new(false),
            gate: Mutex::new(()),
            woken: Condvar::new(),
        }))
    }

    pub fn is_set(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        let _guard = self.0.gate.lock().unwrap();
        self.0.woken.notify_all();
    }

    /// Sleeps for up to `duration`, returning early (and without panicking)
    /// if a stop is requested while asleep.
    pub fn sleep(&self, duration: Duration) {
        if self.is_set() {
            return;
        }
        let guard = self.0.gate.lock().unwrap();
        let _ = self
            .0
            .woken
            .wait_timeout_while(guard, duration, |_| !self.is_set());
    }
}

enum State {
    Pending(Box<dyn FnOnce(StopToken) + Send + 'static>),
    Running { join: JoinHandle<()>, finished: Arc<(Mutex<bool>, Condvar)> },
    Finished,
}

/// A long-running unit of execution with a uniform start/stop/join
/// lifecycle and a cooperative stop flag (§4.1).
pub struct CancellableWorker {
    name: String,
    stop: StopToken,
    state: Mutex<State>,
}

impl CancellableWorker {
    /// Builds a worker around `routine`, which is not spawned until
    /// [`CancellableWorker::start`] is called.
    pub fn new<F>(name: impl Into<String>, routine: F) -> Self
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        Self {
            name: name.into(),
            stop: StopToken::new(),
            state: Mutex::new(State::Pending(Box::new(routine))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idempotent only in the sense required by §4.1: calling `start` twice
    /// fails rather than spawning a second execution unit.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let routine = match std::mem::replace(&mut *state, State::Finished) {
            State::Pending(routine) => routine,
            other => {
                *state = other;
                return Err(RuntimeError::illegal_state(format!(
                    "worker `{}` already started",
                    self.name
                )));
            }
        };

        let stop = self.stop.clone();
        let finished = Arc::new((Mutex::new(false), Condvar::new()));
        let finished_for_thread = finished.clone();
        let name = self.name.clone();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::info!(worker = %name, "worker started");
                routine(stop);
                tracing::info!(worker = %name, "worker finished");
                let (lock, cv) = &*finished_for_thread;
                *lock.lock().unwrap() = true;
                cv.notify_all();
            })
            .expect("failed to spawn OS thread for worker");

        *state = State::Running { join, finished };
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    /// Waits up to `timeout` for the routine to finish.
    pub fn join(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let finished = {
            let state = self.state.lock().unwrap();
            match &*state {
                State::Running { finished, .. } => finished.clone(),
                State::Finished => return Ok(()),
                State::Pending(_) => {
                    return Err(RuntimeError::illegal_state(format!(
                        "worker `{}` was never started",
                        self.name
                    )));
                }
            }
        };

        let (lock, cv) = &*finished;
        let guard = lock.lock().unwrap();
        let (guard, result) = cv.wait_timeout_while(guard, timeout, |done| !*done).unwrap();
        drop(guard);
        if result.timed_out() {
            return Err(RuntimeError::Timeout);
        }

        let mut state = self.state.lock().unwrap();
        if let State::Running { join, .. } = std::mem::replace(&mut *state, State::Finished) {
            let _ = join.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn routine_runs_exactly_once_and_observes_stop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_in = counter.clone();
        let worker = CancellableWorker::new("t", move |stop| {
            while !stop.is_set() {
                counter_in.fetch_add(1, Ordering::SeqCst);
                stop.sleep(Duration::from_millis(5));
            }
        });
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        worker.request_stop();
        worker.join(Duration::from_secs(1)).unwrap();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn starting_twice_fails_with_illegal_state() {
        let worker = CancellableWorker::new("t", |_stop| {});
        worker.start().unwrap();
        worker.join(Duration::from_secs(1)).unwrap();
        assert!(matches!(worker.start(), Err(RuntimeError::IllegalState { .. })));
    }

    #[test]
    fn join_times_out_while_routine_still_running() {
        let worker = CancellableWorker::new("t", |stop| {
            while !stop.is_set() {
                stop.sleep(Duration::from_millis(10));
            }
        });
        worker.start().unwrap();
        assert!(matches!(worker.join(Duration::from_millis(5)), Err(RuntimeError::Timeout)));
        worker.request_stop();
        worker.join(Duration::from_secs(1)).unwrap();
    }
}
