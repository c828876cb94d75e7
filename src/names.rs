//! Resource-name validation and parsing for queues and tasks.

use once_cell::sync::Lazy;
use regex::Regex;

static LOCATION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^projects/[A-Za-z0-9-]+/locations/[A-Za-z0-9-]+$").unwrap());

static QUEUE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^projects/[A-Za-z0-9-]+/locations/[A-Za-z0-9-]+/queues/[A-Za-z0-9-]+$").unwrap()
});

static TASK_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^projects/[A-Za-z0-9-]+/locations/[A-Za-z0-9-]+/queues/[A-Za-z0-9-]+/tasks/[A-Za-z0-9_-]+$",
    )
    .unwrap()
});

pub fn is_valid_parent(name: &str) -> bool {
    LOCATION_NAME.is_match(name)
}

pub fn is_valid_queue_name(name: &str) -> bool {
    QUEUE_NAME.is_match(name)
}

pub fn is_valid_task_name(name: &str) -> bool {
    TASK_NAME.is_match(name)
}

/// The id after the final `/`, e.g. `test` for `.../queues/test`.
pub fn short_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// The queue portion of a task name, i.e. everything before `/tasks/<id>`.
pub fn queue_of_task(task_name: &str) -> Option<&str> {
    let idx = task_name.rfind("/tasks/")?;
    Some(&task_name[..idx])
}

/// The parent (`projects/<P>/locations/<L>`) of a queue name.
pub fn parent_of_queue(queue_name: &str) -> &str {
    match queue_name.rfind("/queues/") {
        Some(idx) => &queue_name[..idx],
        None => queue_name,
    }
}

/// The project id embedded in a queue or task name.
pub fn project_of(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("projects/")?;
    let end = rest.find('/')?;
    Some(&rest[..end])
}
