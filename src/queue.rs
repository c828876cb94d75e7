//! A queue: owns its tasks, the pause/delete gate its workers consult, and
//! the purge/reset/delete lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use crate::dispatch::{self, Dispatcher};
use crate::proto::google::cloud::tasks::v2::queue::State as RunState;
use crate::proto::Queue as QueueState;
use crate::proto::Task as TaskState;
use crate::proto::{now_timestamp, RateLimits, RetryConfig};
use crate::retry::RetryPolicy;
use crate::task::{RemovalCallback, Task};

/// Shared gate every task worker checks at the edge of dispatch.
#[derive(Default)]
pub struct QueueGate {
    paused: AtomicBool,
    deleted: AtomicBool,
}

impl QueueGate {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

/// Tombstoning callback into the registry, keyed by task name.
pub type TaskDoneHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Queue {
    name: String,
    state: Mutex<QueueState>,
    /// `Some` = live task, `None` = name consumed by a finished task. The
    /// local tombstones let a hard reset find every name this queue used.
    tasks: Mutex<HashMap<String, Option<Arc<Task>>>>,
    gate: Arc<QueueGate>,
    policy: RetryPolicy,
    dispatcher: Arc<dyn Dispatcher>,
    on_task_done: TaskDoneHook,
}

impl Queue {
    /// Builds a running queue from the client-supplied configuration,
    /// filling unset fields with service defaults. Returns the queue and a
    /// frozen snapshot for the RPC response.
    pub fn new(
        mut state: QueueState,
        dispatcher: Arc<dyn Dispatcher>,
        on_task_done: TaskDoneHook,
    ) -> (Arc<Self>, QueueState) {
        state.set_state(RunState::Running);
        let retry_config = state.retry_config.get_or_insert_with(RetryConfig::default);
        let policy = RetryPolicy::from_config(retry_config);
        retry_config.max_attempts = policy.max_attempts;
        retry_config.min_backoff = Some(crate::proto::duration_to_proto(policy.min_backoff));
        retry_config.max_backoff = Some(crate::proto::duration_to_proto(policy.max_backoff));
        retry_config.max_doublings = policy.max_doublings as i32;

        let rate_limits = state.rate_limits.get_or_insert_with(RateLimits::default);
        if rate_limits.max_concurrent_dispatches == 0 {
            rate_limits.max_concurrent_dispatches = 1000;
        }
        if rate_limits.max_dispatches_per_second == 0.0 {
            rate_limits.max_dispatches_per_second = 500.0;
        }
        if rate_limits.max_burst_size == 0 {
            rate_limits.max_burst_size = 100;
        }

        let snapshot = state.clone();
        let queue = Arc::new(Self {
            name: state.name.clone(),
            state: Mutex::new(state),
            tasks: Mutex::new(HashMap::new()),
            gate: Arc::new(QueueGate::default()),
            policy,
            dispatcher,
            on_task_done,
        });
        (queue, snapshot)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> QueueState {
        self.state.lock().clone()
    }

    /// Materializes a task in this queue and installs it in the task set.
    /// The caller registers the task and then starts its worker; the
    /// schedule time is absolute, so the delay does not shift the ETA.
    pub fn new_task(self: &Arc<Self>, mut spec: TaskState) -> (Arc<Task>, TaskState) {
        if spec.name.is_empty() {
            spec.name = generate_task_name(&self.name);
        }
        let now = now_timestamp();
        if spec.schedule_time.is_none() {
            spec.schedule_time = Some(now.clone());
        }
        spec.create_time = Some(now);
        dispatch::normalize_target(&mut spec, &self.name);

        let snapshot = spec.clone();
        let on_done: RemovalCallback = {
            let queue = Arc::clone(self);
            Arc::new(move |task: &Task| {
                queue.remove_task(task.name());
                (queue.on_task_done)(task.name());
            })
        };
        let task = Task::new(
            spec,
            self.policy.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.gate),
            on_done,
        );
        self.tasks
            .lock()
            .insert(task.name().to_string(), Some(Arc::clone(&task)));

        (task, snapshot)
    }

    /// Tombstones a finished task in the queue's own set. Entries already
    /// hard-deleted stay gone.
    fn remove_task(&self, name: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(slot) = tasks.get_mut(name) {
            *slot = None;
        }
    }

    fn live_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().values().flatten().cloned().collect()
    }

    /// Snapshots the live tasks' states, sorted by name ascending.
    pub fn list_tasks(&self) -> Vec<TaskState> {
        let mut states: Vec<TaskState> =
            self.live_tasks().iter().map(|task| task.snapshot()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn pause(&self) -> QueueState {
        self.gate.paused.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.set_state(RunState::Paused);
        state.clone()
    }

    pub fn resume(&self) -> QueueState {
        self.gate.paused.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.set_state(RunState::Running);
        state.clone()
    }

    /// Asynchronously deletes every task currently in the queue. Task names
    /// stay tombstoned in the registry; tasks created while the purge runs
    /// are untouched.
    pub fn purge(self: &Arc<Self>) -> QueueState {
        let snapshot = {
            let mut state = self.state.lock();
            state.purge_time = Some(now_timestamp());
            state.clone()
        };
        let live = self.live_tasks();
        info!("Purging {} tasks from {}", live.len(), self.name);
        tokio::spawn(async move {
            for task in live {
                task.delete();
            }
        });
        snapshot
    }

    /// Development-mode purge: synchronous, and releases every task name the
    /// queue has consumed by hard-deleting the registry entries through the
    /// supplied hook.
    pub fn hard_reset(&self, hard_delete: &dyn Fn(&str)) -> QueueState {
        let entries: Vec<(String, Option<Arc<Task>>)> = self.tasks.lock().drain().collect();
        info!("Hard reset of {} ({} names)", self.name, entries.len());
        for (name, slot) in &entries {
            if let Some(task) = slot {
                task.delete();
            }
            hard_delete(name);
        }
        let mut state = self.state.lock();
        state.purge_time = Some(now_timestamp());
        state.clone()
    }

    /// Terminal: stops every worker and refuses further dispatches. The
    /// registry tombstones the queue name.
    pub fn delete(&self) {
        self.gate.deleted.store(true, Ordering::SeqCst);
        let live = self.live_tasks();
        debug!("Deleting queue {} with {} live tasks", self.name, live.len());
        for task in live {
            task.delete();
        }
    }
}

/// `<queue>/tasks/<19 random decimal digits>`, no leading zero.
fn generate_task_name(queue_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(19);
    id.push(char::from(b'1' + rng.gen_range(0..9u8)));
    for _ in 1..19 {
        id.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    format!("{}/tasks/{}", queue_name, id)
}
