//! Cooperative tasks (§4.7): background work built on the same
//! [`CancellableWorker`] primitive as everything else, but with two flavours
//! matching how the work is shaped — a single run to completion, or a
//! periodic loop with an explicit policy for what happens when one
//! iteration runs long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::error::RuntimeError;
use conduit_core::value::Value;
use conduit_core::worker::{CancellableWorker, StopToken};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::rpc::service::PublishHandle;

/// What a [`LoopTask`] does when one [`LoopBody::iterate`] call takes longer
/// than the configured period (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunPolicy {
    /// Start the next iteration immediately instead of waiting out the rest
    /// of the (already missed) period.
    Immediate,
    /// Drop however many period boundaries were missed and resume on the
    /// next one that is still in the future.
    Skip,
    /// Stop the task; [`LoopTask`] reports [`RuntimeError::Overrun`].
    Terminate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Idle,
    Running,
    Finished,
    Overrun,
    Failed(String),
}

pub trait LoopBody: Send {
    fn prepare(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }
    fn iterate(&mut self, settings: &Value) -> Result<(), RuntimeError>;
    fn finalise(&mut self) {}
}

struct SettingsSlot {
    current: Mutex<Value>,
    pending_generation: AtomicU64,
    applied: Mutex<u64>,
    applied_cv: Condvar,
}

impl SettingsSlot {
    fn new(initial: Value) -> Self {
        Self {
            current: Mutex::new(initial),
            pending_generation: AtomicU64::new(0),
            applied: Mutex::new(0),
            applied_cv: Condvar::new(),
        }
    }

    fn update(&self, value: Value) -> u64 {
        *self.current.lock() = value;
        self.pending_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn snapshot(&self) -> (Value, u64) {
        (self.current.lock().clone(), self.pending_generation.load(Ordering::SeqCst))
    }

    fn mark_applied(&self, generation: u64) {
        let mut applied = self.applied.lock();
        if generation > *applied {
            *applied = generation;
        }
        self.applied_cv.notify_all();
    }

    /// Blocks until an iteration has started at or after `generation`.
    fn wait_applied(&self, generation: u64, timeout: Option<Duration>) -> bool {
        let mut applied = self.applied.lock();
        loop {
            if *applied >= generation {
                return true;
            }
            match timeout {
                Some(duration) => {
                    if self.applied_cv.wait_for(&mut applied, duration).timed_out() {
                        return *applied >= generation;
                    }
                }
                None => self.applied_cv.wait(&mut applied),
            }
        }
    }
}

/// A single run-to-completion background job (§4.7 "free-form task").
pub struct FreeFormTask {
    worker: CancellableWorker,
}

impl FreeFormTask {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        Self { worker: CancellableWorker::new(name, run) }
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        self.worker.start()
    }

    pub fn request_stop(&self) {
        self.worker.request_stop();
    }

    pub fn join(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.worker.join(timeout)
    }
}

/// A periodic background job with a live-reloadable settings value and an
/// explicit [`OverrunPolicy`] (§4.7 "loop task").
pub struct LoopTask {
    worker: CancellableWorker,
    settings: Arc<SettingsSlot>,
    status: Arc<Mutex<TaskStatus>>,
}

impl LoopTask {
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        overrun_policy: OverrunPolicy,
        initial_settings: Value,
        mut body: impl LoopBody + 'static,
        publish: Option<PublishHandle>,
    ) -> Self {
        let settings = Arc::new(SettingsSlot::new(initial_settings));
        let status = Arc::new(Mutex::new(TaskStatus::Idle));

        let settings_for_worker = settings.clone();
        let status_for_worker = status.clone();
        let worker = CancellableWorker::new(name, move |stop| {
            set_status(&status_for_worker, &publish, TaskStatus::Running);
            if let Err(err) = body.prepare() {
                set_status(&status_for_worker, &publish, TaskStatus::Failed(err.to_string()));
                return;
            }

            let mut deadline = Instant::now() + period;
            loop {
                if stop.is_set() {
                    break;
                }
                let (snapshot, generation) = settings_for_worker.snapshot();
                let started = Instant::now();
                let outcome = body.iterate(&snapshot);
                settings_for_worker.mark_applied(generation);
                if let Some(publish) = &publish {
                    publish.publish("settings", snapshot);
                }
                if let Err(err) = outcome {
                    set_status(&status_for_worker, &publish, TaskStatus::Failed(err.to_string()));
                    break;
                }

                let elapsed = started.elapsed();
                if elapsed > period {
                    warn!(task = "loop-task", ?elapsed, ?period, "loop iteration overran its period");
                    match overrun_policy {
                        OverrunPolicy::Immediate => deadline = Instant::now() + period,
                        OverrunPolicy::Skip => {
                            let now = Instant::now();
                            while deadline <= now {
                                deadline += period;
                            }
                        }
                        OverrunPolicy::Terminate => {
                            set_status(&status_for_worker, &publish, TaskStatus::Overrun);
                            body.finalise();
                            return;
                        }
                    }
                } else {
                    deadline += period;
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                stop.sleep(remaining);
            }

            body.finalise();
            set_status(&status_for_worker, &publish, TaskStatus::Finished);
        });

        Self { worker, settings, status }
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        self.worker.start()
    }

    pub fn request_stop(&self) {
        self.worker.request_stop();
    }

    pub fn join(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.worker.join(timeout)
    }

    pub fn status(&self) -> TaskStatus {
        self.status.lock().clone()
    }

    /// Queues a new settings value for the next iteration boundary; returns
    /// immediately without waiting for it to take effect (§4.7).
    pub fn update_settings(&self, value: Value) {
        self.settings.update(value);
    }

    /// Blocks until an iteration has started using a settings value at least
    /// as new as the most recent [`LoopTask::update_settings`] call.
    pub fn sync_settings(&self, timeout: Option<Duration>) -> bool {
        let generation = self.settings.pending_generation.load(Ordering::SeqCst);
        self.settings.wait_applied(generation, timeout)
    }
}

fn set_status(status: &Mutex<TaskStatus>, publish: &Option<PublishHandle>, new_status: TaskStatus) {
    *status.lock() = new_status.clone();
    if let Some(publish) = publish {
        let text = match &new_status {
            TaskStatus::Idle => "idle".to_owned(),
            TaskStatus::Running => "running".to_owned(),
            TaskStatus::Finished => "finished".to_owned(),
            TaskStatus::Overrun => "overrun".to_owned(),
            TaskStatus::Failed(message) => format!("failed: {message}"),
        };
        publish.publish("status", Value::Str(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingBody {
        counter: Arc<AtomicU32>,
    }
    impl LoopBody for CountingBody {
        fn iterate(&mut self, _settings: &Value) -> Result<(), RuntimeError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn loop_task_runs_multiple_iterations_until_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = LoopTask::new(
            "t",
            Duration::from_millis(5),
            OverrunPolicy::Skip,
            Value::Null,
            CountingBody { counter: counter.clone() },
            None,
        );
        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        task.request_stop();
        task.join(Duration::from_secs(1)).unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert_eq!(task.status(), TaskStatus::Finished);
    }

    struct OverrunningBody;
    impl LoopBody for OverrunningBody {
        fn iterate(&mut self, _settings: &Value) -> Result<(), RuntimeError> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        }
    }

    #[test]
    fn terminate_policy_stops_the_task_on_the_first_overrun() {
        let task = LoopTask::new("t", Duration::from_millis(1), OverrunPolicy::Terminate, Value::Null, OverrunningBody, None);
        task.start().unwrap();
        task.join(Duration::from_secs(2)).unwrap();
        assert_eq!(task.status(), TaskStatus::Overrun);
    }

    struct SettingsEchoBody {
        last: Arc<Mutex<Value>>,
    }
    impl LoopBody for SettingsEchoBody {
        fn iterate(&mut self, settings: &Value) -> Result<(), RuntimeError> {
            *self.last.lock() = settings.clone();
            Ok(())
        }
    }

    #[test]
    fn update_settings_is_visible_to_the_next_iteration() {
        let last = Arc::new(Mutex::new(Value::Null));
        let task = LoopTask::new(
            "t",
            Duration::from_millis(5),
            OverrunPolicy::Immediate,
            Value::Int(0),
            SettingsEchoBody { last: last.clone() },
            None,
        );
        task.start().unwrap();
        task.update_settings(Value::Int(42));
        assert!(task.sync_settings(Some(Duration::from_secs(1))));
        task.request_stop();
        task.join(Duration::from_secs(1)).unwrap();
        assert_eq!(*last.lock(), Value::Int(42));
    }

    struct SkipAlignmentBody {
        start: Instant,
        timestamps: Arc<Mutex<Vec<Duration>>>,
    }
    impl LoopBody for SkipAlignmentBody {
        fn prepare(&mut self) -> Result<(), RuntimeError> {
            self.start = Instant::now();
            Ok(())
        }
        fn iterate(&mut self, _settings: &Value) -> Result<(), RuntimeError> {
            self.timestamps.lock().push(self.start.elapsed());
            std::thread::sleep(Duration::from_millis(25));
            Ok(())
        }
    }

    /// A 10ms period with an iteration that consistently overruns by 15ms
    /// under [`OverrunPolicy::Skip`] should land each iteration's start on
    /// the next still-future multiple of the period — 0, 30, 60, 90ms.
    #[test]
    fn skip_policy_aligns_iteration_starts_to_period_grid_boundaries() {
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let task = LoopTask::new(
            "t",
            Duration::from_millis(10),
            OverrunPolicy::Skip,
            Value::Null,
            SkipAlignmentBody { start: Instant::now(), timestamps: timestamps.clone() },
            None,
        );
        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(110));
        task.request_stop();
        task.join(Duration::from_secs(1)).unwrap();

        let recorded = timestamps.lock().clone();
        assert!(recorded.len() >= 3, "expected at least 3 iterations, got {}", recorded.len());
        for (observed, expected_ms) in recorded.iter().zip([0i64, 30, 60, 90]) {
            let observed_ms = observed.as_millis() as i64;
            assert!(
                (observed_ms - expected_ms).abs() <= 15,
                "iteration start {observed_ms}ms not aligned to the {expected_ms}ms grid boundary"
            );
        }
    }
}
