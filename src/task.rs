//! A single scheduled task and its dispatch worker.
//!
//! Every task owns one worker loop: it sleeps until the schedule time,
//! checks the queue gate, performs one HTTP attempt, and either finishes or
//! re-arms itself with the retry policy's backoff. External calls (`run`,
//! `delete`) never touch the worker's state directly; they signal it through
//! a fire-now notification and a cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::dispatch::{self, Dispatcher};
use crate::proto::google::rpc::Status as RpcStatus;
use crate::proto::{now_timestamp, timestamp_from_chrono, timestamp_to_chrono, Attempt};
use crate::proto::Task as TaskState;
use crate::queue::QueueGate;
use crate::retry::RetryPolicy;

/// How often a gated worker re-checks a paused queue.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Invoked exactly once when a task reaches its terminal state, from either
/// the worker or a `delete` caller.
pub type RemovalCallback = Arc<dyn Fn(&Task) + Send + Sync>;

enum AttemptOutcome {
    /// Terminal: delivered, exhausted, or nothing to send.
    Completed,
    /// Failed with budget remaining; the schedule time has been advanced.
    Retry,
    /// A concurrent `delete` won; the response (if any) is discarded.
    Cancelled,
}

pub struct Task {
    name: String,
    state: Mutex<TaskState>,
    policy: RetryPolicy,
    dispatcher: Arc<dyn Dispatcher>,
    gate: Arc<QueueGate>,
    on_done: RemovalCallback,
    fire: Notify,
    cancel: Notify,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl Task {
    pub(crate) fn new(
        state: TaskState,
        policy: RetryPolicy,
        dispatcher: Arc<dyn Dispatcher>,
        gate: Arc<QueueGate>,
        on_done: RemovalCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: state.name.clone(),
            state: Mutex::new(state),
            policy,
            dispatcher,
            gate,
            on_done,
            fire: Notify::new(),
            cancel: Notify::new(),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    /// Starts the dispatch worker. Called once the task is installed in both
    /// the queue's task set and the registry, so that the terminal removal
    /// callback can never race with its own installation.
    pub(crate) fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.work().await });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defensive clone of the task state for RPC responses; the worker keeps
    /// mutating the original.
    pub fn snapshot(&self) -> TaskState {
        self.state.lock().clone()
    }

    /// Forces an immediate dispatch regardless of schedule time. The worker
    /// is strictly sequential, so a run racing an in-flight attempt queues a
    /// single follow-up dispatch rather than overlapping it.
    pub fn run(&self) -> TaskState {
        {
            let mut state = self.state.lock();
            state.schedule_time = Some(now_timestamp());
        }
        self.fire.notify_one();
        self.snapshot()
    }

    /// Cancels the timer and any in-flight attempt and fires the removal
    /// callback. Safe to call concurrently and more than once.
    pub fn delete(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.notify_one();
        self.finish();
    }

    fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            (self.on_done)(self);
        }
    }

    fn delay_until_scheduled(&self) -> Duration {
        let scheduled = self.state.lock().schedule_time.clone();
        match scheduled {
            Some(ts) => (timestamp_to_chrono(&ts) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    async fn work(&self) {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }

            let wait = self.delay_until_scheduled();
            tokio::select! {
                _ = self.cancel.notified() => return,
                _ = self.fire.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            // Queue gate: a paused queue holds the task at the edge of
            // dispatch; a deleted queue stops it for good.
            loop {
                if self.cancelled.load(Ordering::SeqCst) || self.gate.is_deleted() {
                    return;
                }
                if !self.gate.is_paused() {
                    break;
                }
                tokio::select! {
                    _ = self.cancel.notified() => return,
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                }
            }

            match self.attempt().await {
                AttemptOutcome::Completed => {
                    self.finish();
                    return;
                }
                AttemptOutcome::Retry => {}
                AttemptOutcome::Cancelled => return,
            }
        }
    }

    /// One dispatch attempt, start to finish. Counters follow the service's
    /// bookkeeping: headers reflect the state before the attempt,
    /// `dispatch_count` grows on completion, `response_count` only on
    /// failure.
    async fn attempt(&self) -> AttemptOutcome {
        let request = {
            let mut state = self.state.lock();
            let dispatch_time = now_timestamp();
            state.last_attempt = Some(Attempt {
                schedule_time: state.schedule_time.clone(),
                dispatch_time: Some(dispatch_time.clone()),
                ..Default::default()
            });
            if state.first_attempt.is_none() {
                state.first_attempt = Some(Attempt {
                    dispatch_time: Some(dispatch_time),
                    ..Default::default()
                });
            }
            dispatch::build_request(&state)
        };
        let Some(request) = request else {
            debug!("Task {} has no message type, nothing to dispatch", self.name);
            return AttemptOutcome::Completed;
        };

        let outcome = tokio::select! {
            _ = self.cancel.notified() => return AttemptOutcome::Cancelled,
            outcome = self.dispatcher.dispatch(request) => outcome,
        };
        if self.cancelled.load(Ordering::SeqCst) {
            return AttemptOutcome::Cancelled;
        }

        let mut state = self.state.lock();
        state.dispatch_count += 1;
        if outcome.success() {
            debug!("Task {} delivered", self.name);
            return AttemptOutcome::Completed;
        }

        state.response_count += 1;
        if let Some(last) = state.last_attempt.as_mut() {
            last.response_time = Some(now_timestamp());
            last.response_status = Some(RpcStatus {
                code: outcome.rpc_code(),
                message: outcome.rpc_message(),
            });
        }

        let elapsed = state
            .first_attempt
            .as_ref()
            .and_then(|attempt| attempt.dispatch_time.as_ref())
            .map(|t| {
                (Utc::now() - timestamp_to_chrono(t))
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });
        match self.policy.next_backoff(state.dispatch_count, elapsed) {
            None => {
                debug!(
                    "Task {} gave up after {} dispatches",
                    self.name, state.dispatch_count
                );
                AttemptOutcome::Completed
            }
            Some(delay) => {
                let eta = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                state.schedule_time = Some(timestamp_from_chrono(eta));
                AttemptOutcome::Retry
            }
        }
    }
}
