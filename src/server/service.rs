//! The registry and its gRPC face: two name-keyed maps with tombstone slots
//! (queues and tasks) behind the Cloud Tasks service trait.
//!
//! Each map entry is in one of three states — absent (never existed),
//! `None` (tombstone: existed recently), `Some` (live) — because the public
//! error taxonomy distinguishes all three.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::dispatch::{Dispatcher, HttpDispatcher};
use crate::error::{EmulatorError, Result};
use crate::names;
use crate::proto::google::cloud::tasks::v2::{
    CreateQueueRequest, CreateTaskRequest, DeleteQueueRequest, DeleteTaskRequest, GetQueueRequest,
    GetTaskRequest, ListQueuesRequest, ListQueuesResponse, ListTasksRequest, ListTasksResponse,
    PauseQueueRequest, PurgeQueueRequest, ResumeQueueRequest, RunTaskRequest, UpdateQueueRequest,
};
use crate::proto::google::iam::v1 as iam;
use crate::proto::{CloudTasks, Queue as QueueState, Task as TaskState};
use crate::queue::{Queue, TaskDoneHook};
use crate::task::Task;

const MSG_QUEUE_UNINITIALIZED: &str = "Queue does not exist. If you just created the queue, wait at least a minute for the queue to initialize.";
const MSG_TASK_TOMBSTONED: &str = "The task no longer exists, though a task with this name existed recently. The task either successfully completed or was deleted.";

const DEFAULT_PAGE_SIZE: usize = 1000;
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// When set, PurgeQueue behaves like the development environment: it
    /// purges synchronously and releases all task names, instead of
    /// mirroring production's async purge that keeps names reserved.
    pub hard_reset_on_purge_queue: bool,
}

/// Registry lookup result, mirroring the three observable name states.
enum Fetched<T> {
    Missing,
    Tombstone,
    Live(Arc<T>),
}

type TaskMap = Arc<Mutex<HashMap<String, Option<Arc<Task>>>>>;

pub struct Server {
    queues: Mutex<HashMap<String, Option<Arc<Queue>>>>,
    tasks: TaskMap,
    dispatcher: Arc<dyn Dispatcher>,
    options: ServerOptions,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self::with_dispatcher(options, Arc::new(HttpDispatcher::new()))
    }

    /// Swaps the outbound HTTP collaborator; tests inject recording
    /// dispatchers through this.
    pub fn with_dispatcher(options: ServerOptions, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            dispatcher,
            options,
        }
    }

    fn fetch_queue(&self, name: &str) -> Fetched<Queue> {
        match self.queues.lock().get(name) {
            None => Fetched::Missing,
            Some(None) => Fetched::Tombstone,
            Some(Some(queue)) => Fetched::Live(Arc::clone(queue)),
        }
    }

    fn fetch_task(&self, name: &str) -> Fetched<Task> {
        match self.tasks.lock().get(name) {
            None => Fetched::Missing,
            Some(None) => Fetched::Tombstone,
            Some(Some(task)) => Fetched::Live(Arc::clone(task)),
        }
    }

    /// The queue for operations that treat tombstoned and never-existed
    /// queues identically, as the real service does.
    fn live_queue(&self, name: &str) -> Result<Arc<Queue>> {
        match self.fetch_queue(name) {
            Fetched::Live(queue) => Ok(queue),
            Fetched::Missing | Fetched::Tombstone => Err(EmulatorError::NotFound(
                MSG_QUEUE_UNINITIALIZED.to_string(),
            )),
        }
    }

    pub fn create_queue(&self, request: CreateQueueRequest) -> Result<QueueState> {
        let state = request.queue.unwrap_or_default();

        if !names::is_valid_queue_name(&state.name) {
            return Err(EmulatorError::InvalidArgument(
                "Queue name must be formatted: \"projects/<PROJECT_ID>/locations/<LOCATION_ID>/queues/<QUEUE_ID>\"".to_string(),
            ));
        }
        if !names::is_valid_parent(&request.parent) {
            return Err(EmulatorError::InvalidArgument(
                "Invalid resource field value in the request.".to_string(),
            ));
        }
        match self.fetch_queue(&state.name) {
            Fetched::Live(_) => {
                return Err(EmulatorError::AlreadyExists("Queue already exists".to_string()))
            }
            Fetched::Tombstone => {
                return Err(EmulatorError::FailedPrecondition(
                    "The queue cannot be created because a queue with this name existed too recently.".to_string(),
                ))
            }
            Fetched::Missing => {}
        }

        let tasks = Arc::clone(&self.tasks);
        let on_task_done: TaskDoneHook = Arc::new(move |name: &str| {
            let mut tasks = tasks.lock();
            if let Some(slot) = tasks.get_mut(name) {
                *slot = None;
            }
        });
        let (queue, snapshot) = Queue::new(state, Arc::clone(&self.dispatcher), on_task_done);
        info!("Created queue {}", queue.name());
        self.queues
            .lock()
            .insert(queue.name().to_string(), Some(queue));

        Ok(snapshot)
    }

    pub fn get_queue(&self, request: GetQueueRequest) -> Result<QueueState> {
        // The service answers identically whether the queue was recently
        // deleted or never existed.
        Ok(self.live_queue(&request.name)?.snapshot())
    }

    pub fn list_queues(&self, _request: ListQueuesRequest) -> Result<ListQueuesResponse> {
        let mut queues: Vec<QueueState> = self
            .queues
            .lock()
            .values()
            .flatten()
            .map(|queue| queue.snapshot())
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ListQueuesResponse {
            queues,
            next_page_token: String::new(),
        })
    }

    pub fn delete_queue(&self, request: DeleteQueueRequest) -> Result<()> {
        let queue = match self.fetch_queue(&request.name) {
            Fetched::Live(queue) => queue,
            Fetched::Missing | Fetched::Tombstone => {
                return Err(EmulatorError::NotFound(
                    "Requested entity was not found.".to_string(),
                ))
            }
        };

        queue.delete();
        self.queues.lock().insert(request.name.clone(), None);
        info!("Deleted queue {}", request.name);
        Ok(())
    }

    pub fn purge_queue(&self, request: PurgeQueueRequest) -> Result<QueueState> {
        let queue = self.live_queue(&request.name)?;

        if self.options.hard_reset_on_purge_queue {
            // Development behaviour: synchronous, and releases all task names
            let tasks = Arc::clone(&self.tasks);
            Ok(queue.hard_reset(&move |name: &str| {
                tasks.lock().remove(name);
            }))
        } else {
            // Production behaviour: an async purge that keeps names reserved
            Ok(queue.purge())
        }
    }

    pub fn pause_queue(&self, request: PauseQueueRequest) -> Result<QueueState> {
        Ok(self.live_queue(&request.name)?.pause())
    }

    pub fn resume_queue(&self, request: ResumeQueueRequest) -> Result<QueueState> {
        Ok(self.live_queue(&request.name)?.resume())
    }

    pub fn create_task(&self, request: CreateTaskRequest) -> Result<TaskState> {
        let queue_name = request.parent;
        let queue = match self.fetch_queue(&queue_name) {
            Fetched::Live(queue) => queue,
            Fetched::Missing => {
                return Err(EmulatorError::NotFound("Queue does not exist.".to_string()))
            }
            Fetched::Tombstone => {
                return Err(EmulatorError::FailedPrecondition(
                    "The queue no longer exists, though a queue with this name existed recently."
                        .to_string(),
                ))
            }
        };

        let spec = request.task.unwrap_or_default();
        if spec.message_type.is_none() {
            return Err(EmulatorError::InvalidArgument(
                "Task is missing a message type (http_request or app_engine_http_request)."
                    .to_string(),
            ));
        }
        if !spec.name.is_empty() {
            // A caller-chosen name must be valid, unique, and belong here
            if !names::is_valid_task_name(&spec.name) {
                return Err(EmulatorError::InvalidArgument(
                    "Task name must be formatted: \"projects/<PROJECT_ID>/locations/<LOCATION_ID>/queues/<QUEUE_ID>/tasks/<TASK_ID>\"".to_string(),
                ));
            }
            if names::queue_of_task(&spec.name) != Some(queue_name.as_str()) {
                return Err(EmulatorError::InvalidArgument(format!(
                    "The queue name from request ('{}') must be the same as the queue name in the named task ('{}').",
                    spec.name, queue_name,
                )));
            }
            if self.tasks.lock().contains_key(&spec.name) {
                return Err(EmulatorError::AlreadyExists(
                    "Requested entity already exists".to_string(),
                ));
            }
        }

        let (task, state) = queue.new_task(spec);
        self.tasks
            .lock()
            .insert(task.name().to_string(), Some(Arc::clone(&task)));
        task.start();
        debug!("Created task {}", task.name());

        Ok(state)
    }

    pub fn get_task(&self, request: GetTaskRequest) -> Result<TaskState> {
        match self.fetch_task(&request.name) {
            Fetched::Missing => Err(EmulatorError::NotFound("Task does not exist.".to_string())),
            Fetched::Tombstone => Err(EmulatorError::FailedPrecondition(
                MSG_TASK_TOMBSTONED.to_string(),
            )),
            Fetched::Live(task) => Ok(task.snapshot()),
        }
    }

    pub fn delete_task(&self, request: DeleteTaskRequest) -> Result<()> {
        match self.fetch_task(&request.name) {
            Fetched::Missing => Err(EmulatorError::NotFound("Task does not exist.".to_string())),
            Fetched::Tombstone => Err(EmulatorError::NotFound(MSG_TASK_TOMBSTONED.to_string())),
            Fetched::Live(task) => {
                // The registry tombstone is written by the queue's removal
                // callback, not here
                task.delete();
                debug!("Deleted task {}", request.name);
                Ok(())
            }
        }
    }

    pub fn run_task(&self, request: RunTaskRequest) -> Result<TaskState> {
        match self.fetch_task(&request.name) {
            Fetched::Missing => Err(EmulatorError::NotFound("Task does not exist.".to_string())),
            Fetched::Tombstone => Err(EmulatorError::NotFound(MSG_TASK_TOMBSTONED.to_string())),
            Fetched::Live(task) => Ok(task.run()),
        }
    }

    pub fn list_tasks(&self, request: ListTasksRequest) -> Result<ListTasksResponse> {
        let queue = self.live_queue(&request.parent)?;
        let states = queue.list_tasks();

        let start = if request.page_token.is_empty() {
            0
        } else {
            request.page_token.parse::<usize>().map_err(|_| {
                EmulatorError::InvalidArgument(format!(
                    "invalid page token: {}",
                    request.page_token
                ))
            })?
        };

        let page_size = match request.page_size {
            0 => DEFAULT_PAGE_SIZE,
            size if size < 0 || size as usize > MAX_PAGE_SIZE => {
                return Err(EmulatorError::InvalidArgument(format!(
                    "invalid page size: {}",
                    size
                )))
            }
            size => size as usize,
        };

        let next_page_token = if states.len() > start.saturating_add(page_size) {
            (start + page_size).to_string()
        } else {
            String::new()
        };
        let tasks = states.into_iter().skip(start).take(page_size).collect();

        Ok(ListTasksResponse {
            tasks,
            next_page_token,
        })
    }
}

#[tonic::async_trait]
impl CloudTasks for Server {
    async fn list_queues(
        &self,
        request: Request<ListQueuesRequest>,
    ) -> std::result::Result<Response<ListQueuesResponse>, Status> {
        Ok(Response::new(Server::list_queues(self, request.into_inner())?))
    }

    async fn get_queue(
        &self,
        request: Request<GetQueueRequest>,
    ) -> std::result::Result<Response<QueueState>, Status> {
        Ok(Response::new(Server::get_queue(self, request.into_inner())?))
    }

    async fn create_queue(
        &self,
        request: Request<CreateQueueRequest>,
    ) -> std::result::Result<Response<QueueState>, Status> {
        Ok(Response::new(Server::create_queue(self, request.into_inner())?))
    }

    async fn update_queue(
        &self,
        _request: Request<UpdateQueueRequest>,
    ) -> std::result::Result<Response<QueueState>, Status> {
        Err(EmulatorError::Unimplemented.into())
    }

    async fn delete_queue(
        &self,
        request: Request<DeleteQueueRequest>,
    ) -> std::result::Result<Response<()>, Status> {
        Server::delete_queue(self, request.into_inner())?;
        Ok(Response::new(()))
    }

    async fn purge_queue(
        &self,
        request: Request<PurgeQueueRequest>,
    ) -> std::result::Result<Response<QueueState>, Status> {
        Ok(Response::new(Server::purge_queue(self, request.into_inner())?))
    }

    async fn pause_queue(
        &self,
        request: Request<PauseQueueRequest>,
    ) -> std::result::Result<Response<QueueState>, Status> {
        Ok(Response::new(Server::pause_queue(self, request.into_inner())?))
    }

    async fn resume_queue(
        &self,
        request: Request<ResumeQueueRequest>,
    ) -> std::result::Result<Response<QueueState>, Status> {
        Ok(Response::new(Server::resume_queue(self, request.into_inner())?))
    }

    async fn get_iam_policy(
        &self,
        _request: Request<iam::GetIamPolicyRequest>,
    ) -> std::result::Result<Response<iam::Policy>, Status> {
        Err(EmulatorError::Unimplemented.into())
    }

    async fn set_iam_policy(
        &self,
        _request: Request<iam::SetIamPolicyRequest>,
    ) -> std::result::Result<Response<iam::Policy>, Status> {
        Err(EmulatorError::Unimplemented.into())
    }

    async fn test_iam_permissions(
        &self,
        _request: Request<iam::TestIamPermissionsRequest>,
    ) -> std::result::Result<Response<iam::TestIamPermissionsResponse>, Status> {
        Err(EmulatorError::Unimplemented.into())
    }

    async fn list_tasks(
        &self,
        request: Request<ListTasksRequest>,
    ) -> std::result::Result<Response<ListTasksResponse>, Status> {
        Ok(Response::new(Server::list_tasks(self, request.into_inner())?))
    }

    async fn get_task(
        &self,
        request: Request<GetTaskRequest>,
    ) -> std::result::Result<Response<TaskState>, Status> {
        Ok(Response::new(Server::get_task(self, request.into_inner())?))
    }

    async fn create_task(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> std::result::Result<Response<TaskState>, Status> {
        Ok(Response::new(Server::create_task(self, request.into_inner())?))
    }

    async fn delete_task(
        &self,
        request: Request<DeleteTaskRequest>,
    ) -> std::result::Result<Response<()>, Status> {
        Server::delete_task(self, request.into_inner())?;
        Ok(Response::new(()))
    }

    async fn run_task(
        &self,
        request: Request<RunTaskRequest>,
    ) -> std::result::Result<Response<TaskState>, Status> {
        Ok(Response::new(Server::run_task(self, request.into_inner())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchOutcome, DispatchRequest};
    use crate::proto::{timestamp_from_chrono, HttpRequest, MessageType};
    use async_trait::async_trait;

    const PARENT: &str = "projects/TestProject/locations/TestLocation";
    const QUEUE: &str = "projects/TestProject/locations/TestLocation/queues/test";

    struct NullDispatcher;

    #[async_trait]
    impl Dispatcher for NullDispatcher {
        async fn dispatch(&self, _request: DispatchRequest) -> DispatchOutcome {
            DispatchOutcome { code: Some(200) }
        }
    }

    fn test_server() -> Server {
        Server::with_dispatcher(ServerOptions::default(), Arc::new(NullDispatcher))
    }

    fn create_test_queue(server: &Server) -> QueueState {
        server
            .create_queue(CreateQueueRequest {
                parent: PARENT.to_string(),
                queue: Some(QueueState {
                    name: QUEUE.to_string(),
                    ..Default::default()
                }),
            })
            .unwrap()
    }

    fn far_future_task(name: &str) -> TaskState {
        TaskState {
            name: name.to_string(),
            message_type: Some(MessageType::HttpRequest(HttpRequest {
                url: "http://target/".to_string(),
                ..Default::default()
            })),
            schedule_time: Some(timestamp_from_chrono(
                chrono::Utc::now() + chrono::Duration::hours(1),
            )),
            ..Default::default()
        }
    }

    #[test]
    fn create_queue_validates_names() {
        let server = test_server();

        let err = server
            .create_queue(CreateQueueRequest {
                parent: PARENT.to_string(),
                queue: Some(QueueState {
                    name: "hello_q".to_string(),
                    ..Default::default()
                }),
            })
            .unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidArgument(_)));

        let err = server
            .create_queue(CreateQueueRequest {
                parent: "not-a-parent".to_string(),
                queue: Some(QueueState {
                    name: QUEUE.to_string(),
                    ..Default::default()
                }),
            })
            .unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidArgument(_)));
    }

    #[test]
    fn queue_names_stay_reserved_after_delete() {
        let server = test_server();
        create_test_queue(&server);

        let err = server
            .create_queue(CreateQueueRequest {
                parent: PARENT.to_string(),
                queue: Some(QueueState {
                    name: QUEUE.to_string(),
                    ..Default::default()
                }),
            })
            .unwrap_err();
        assert!(matches!(err, EmulatorError::AlreadyExists(_)));

        server
            .delete_queue(DeleteQueueRequest {
                name: QUEUE.to_string(),
            })
            .unwrap();

        // Tombstoned now: GetQueue indistinguishable from never-existed,
        // re-creation distinguishable
        let err = server
            .get_queue(GetQueueRequest {
                name: QUEUE.to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, EmulatorError::NotFound(_)));

        let err = server
            .create_queue(CreateQueueRequest {
                parent: PARENT.to_string(),
                queue: Some(QueueState {
                    name: QUEUE.to_string(),
                    ..Default::default()
                }),
            })
            .unwrap_err();
        assert!(matches!(err, EmulatorError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn list_tasks_paginates_sorted_by_name() {
        let server = test_server();
        create_test_queue(&server);

        for id in ["e", "c", "a", "d", "b"] {
            server
                .create_task(CreateTaskRequest {
                    parent: QUEUE.to_string(),
                    task: Some(far_future_task(&format!("{}/tasks/{}", QUEUE, id))),
                    response_view: 0,
                })
                .unwrap();
        }

        let page = server
            .list_tasks(ListTasksRequest {
                parent: QUEUE.to_string(),
                page_size: 2,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = page.tasks.iter().map(|t| names::short_id(&t.name)).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(page.next_page_token, "2");

        let page = server
            .list_tasks(ListTasksRequest {
                parent: QUEUE.to_string(),
                page_size: 2,
                page_token: "2".to_string(),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = page.tasks.iter().map(|t| names::short_id(&t.name)).collect();
        assert_eq!(ids, vec!["c", "d"]);
        assert_eq!(page.next_page_token, "4");

        let page = server
            .list_tasks(ListTasksRequest {
                parent: QUEUE.to_string(),
                page_size: 2,
                page_token: "4".to_string(),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = page.tasks.iter().map(|t| names::short_id(&t.name)).collect();
        assert_eq!(ids, vec!["e"]);
        assert_eq!(page.next_page_token, "");
    }

    #[tokio::test]
    async fn list_tasks_rejects_bad_page_parameters() {
        let server = test_server();
        create_test_queue(&server);

        for (page_size, page_token) in [(-1, ""), (1001, ""), (0, "foo")] {
            let err = server
                .list_tasks(ListTasksRequest {
                    parent: QUEUE.to_string(),
                    page_size,
                    page_token: page_token.to_string(),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, EmulatorError::InvalidArgument(_)));
        }

        // Zero means the 1000 default; a past-the-end token yields an empty page
        let page = server
            .list_tasks(ListTasksRequest {
                parent: QUEUE.to_string(),
                page_size: 0,
                page_token: "50".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(page.tasks.is_empty());
        assert_eq!(page.next_page_token, "");
    }

    #[tokio::test]
    async fn create_task_enforces_queue_prefix() {
        let server = test_server();
        create_test_queue(&server);

        let err = server
            .create_task(CreateTaskRequest {
                parent: QUEUE.to_string(),
                task: Some(far_future_task(
                    "projects/TestProject/locations/TestLocation/queues/SomeOtherQueue/tasks/valid-name",
                )),
                response_view: 0,
            })
            .unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidArgument(_)));
        assert!(err.to_string().starts_with("The queue name from request"));
    }
}
