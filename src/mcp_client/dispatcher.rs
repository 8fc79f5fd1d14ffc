// ABOUTME: Async request dispatcher with priority queues and per-server caps
//
// Requests are queued by priority (Urgent > High > Normal > Low, FIFO within
// a priority) and dispatched while their server is below
// max_concurrent_per_server. Every dispatched request runs as its own tokio
// task with a separate timer task; whichever of result, timer or cancel
// reaches finish() first decides the terminal state, and the completion
// callback runs exactly once, outside the lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::client::{McpClient, Operation};
use super::config::DispatcherConfig;
use super::error::{DispatchError, McpError, McpResult};
use super::pool::{ConnectionPool, PooledConnection};
use super::protocol::Response;

/// Queue priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dispatch order
    pub const ALL: [Self; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    const fn index(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Dispatcher-assigned request id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Queued,
    /// Left its queue, waiting for a connection; nothing written yet
    Dispatched,
    Sending,
    Waiting,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RequestState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

/// What a completion callback receives
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub id: RequestId,
    pub server: String,
    /// Tool name or method
    pub operation: String,
    pub priority: Priority,
    pub state: RequestState,
    /// Server response; present for Completed and for application errors
    pub response: Option<Response>,
    pub error: Option<String>,
    /// Time from submission to the terminal state
    pub elapsed: Duration,
    /// Order in which the request left its queue, if it ever did
    pub dispatch_seq: Option<u64>,
    #[serde(skip)]
    pub queued_at: Instant,
    /// When the request was last handed to a connection
    #[serde(skip)]
    pub sent_at: Option<Instant>,
    #[serde(skip)]
    pub completed_at: Instant,
}

impl RequestOutcome {
    /// Parsed result of a completed request
    #[must_use]
    pub fn result_value(&self) -> Option<Value> {
        self.response.as_ref().and_then(Response::result_value)
    }
}

/// Completion callback
pub type Callback = Box<dyn FnOnce(&RequestOutcome) + Send + 'static>;

/// Snapshot of a live request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    pub id: RequestId,
    pub server: String,
    pub operation: String,
    pub priority: Priority,
    pub state: RequestState,
    pub age: Duration,
    pub timeout: Duration,
    pub dispatch_seq: Option<u64>,
}

/// Dispatcher totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub total_cancelled: u64,
    pub queue_depth: usize,
    pub active: usize,
}

struct AsyncRequest {
    server: String,
    operation: Operation,
    priority: Priority,
    state: RequestState,
    queued_at: Instant,
    sent_at: Option<Instant>,
    timeout: Duration,
    /// Fixed at first dispatch and kept across requeues
    deadline: Option<Instant>,
    dispatch_seq: Option<u64>,
    callback: Option<Callback>,
    timer: Option<AbortHandle>,
    task: Option<AbortHandle>,
}

/// Who is finishing a request; that party's own task is not aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finisher {
    Timer,
    Task,
    Caller,
}

/// A callback ready to run once the lock is released
struct Completion {
    callback: Option<Callback>,
    outcome: RequestOutcome,
}

impl Completion {
    fn fire(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(&self.outcome);
        }
    }
}

#[derive(Default)]
struct DispatchState {
    queues: [VecDeque<RequestId>; 4],
    requests: HashMap<RequestId, AsyncRequest>,
    active: HashMap<String, usize>,
    next_id: u64,
    next_seq: u64,
    redrain_scheduled: bool,
    stats: DispatcherStats,
}

impl DispatchState {
    fn queue_depth(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<(Priority, RequestId)> {
        Priority::ALL
            .into_iter()
            .find_map(|p| self.queues[p.index()].pop_front().map(|id| (p, id)))
    }

    fn release_slot(&mut self, server: &str) {
        if let Some(count) = self.active.get_mut(server) {
            *count = count.saturating_sub(1);
        }
    }

    /// Move a live request to a terminal state. None if it already finished.
    fn finish(
        &mut self,
        id: RequestId,
        state: RequestState,
        response: Option<Response>,
        error: Option<String>,
        finisher: Finisher,
    ) -> Option<Completion> {
        let mut request = self.requests.remove(&id)?;

        match request.state {
            RequestState::Queued => self.queues[request.priority.index()].retain(|q| *q != id),
            RequestState::Dispatched | RequestState::Sending | RequestState::Waiting => {
                self.release_slot(&request.server);
            }
            _ => {}
        }

        if finisher != Finisher::Timer {
            if let Some(timer) = request.timer.take() {
                timer.abort();
            }
        }
        // A timed-out exchange runs on until its own receive deadline so the
        // connection and metrics see the outcome; only cancellation preempts
        if finisher == Finisher::Caller {
            if let Some(task) = request.task.take() {
                task.abort();
            }
        }

        match state {
            RequestState::Completed => self.stats.total_completed += 1,
            RequestState::Timeout => self.stats.total_timeout += 1,
            RequestState::Cancelled => self.stats.total_cancelled += 1,
            _ => self.stats.total_failed += 1,
        }

        Some(Completion {
            callback: request.callback.take(),
            outcome: RequestOutcome {
                id,
                server: request.server,
                operation: request.operation.label().to_string(),
                priority: request.priority,
                state,
                response,
                error,
                elapsed: request.queued_at.elapsed(),
                dispatch_seq: request.dispatch_seq,
                queued_at: request.queued_at,
                sent_at: request.sent_at,
                completed_at: Instant::now(),
            },
        })
    }
}

struct Shared {
    state: Mutex<DispatchState>,
    finished: Notify,
}

/// Priority dispatcher over one client, optionally drawing connections from
/// a pool. Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct AsyncDispatcher {
    client: Arc<McpClient>,
    pool: Option<Arc<ConnectionPool>>,
    config: DispatcherConfig,
    shared: Arc<Shared>,
    runtime: Handle,
}

impl fmt::Debug for AsyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDispatcher")
            .field("config", &self.config)
            .field("pooled", &self.pool.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl AsyncDispatcher {
    /// Dispatcher using the client's shared connection per server
    ///
    /// # Panics
    /// When called outside a tokio runtime
    #[must_use]
    pub fn new(client: Arc<McpClient>, config: DispatcherConfig) -> Self {
        info!(
            max_concurrent = config.max_concurrent_per_server,
            default_timeout_ms = u64::try_from(config.default_timeout.as_millis()).unwrap_or(u64::MAX),
            "Async dispatcher created"
        );
        Self {
            client,
            pool: None,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(DispatchState {
                    next_id: 1,
                    next_seq: 1,
                    ..DispatchState::default()
                }),
                finished: Notify::new(),
            }),
            runtime: Handle::current(),
        }
    }

    /// Give each dispatched request its own pooled connection
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // === Submission ===

    /// Queue a request and drain what the limits allow
    pub fn submit(
        &self,
        server: &str,
        operation: Operation,
        priority: Priority,
        timeout: Option<Duration>,
        callback: Callback,
    ) -> RequestId {
        let id = self.enqueue(server, operation, priority, timeout, callback);
        self.process_queue();
        id
    }

    fn enqueue(
        &self,
        server: &str,
        operation: Operation,
        priority: Priority,
        timeout: Option<Duration>,
        callback: Callback,
    ) -> RequestId {
        let mut state = self.lock();
        let id = RequestId(state.next_id);
        state.next_id += 1;

        debug!(request = %id, server = %server, operation = %operation.label(), ?priority, "Request queued");
        state.requests.insert(
            id,
            AsyncRequest {
                server: server.to_string(),
                operation,
                priority,
                state: RequestState::Queued,
                queued_at: Instant::now(),
                sent_at: None,
                timeout: timeout.unwrap_or(self.config.default_timeout),
                deadline: None,
                dispatch_seq: None,
                callback: Some(callback),
                timer: None,
                task: None,
            },
        );
        state.queues[priority.index()].push_back(id);
        state.stats.total_queued += 1;
        id
    }

    /// Submit a tool call
    pub fn call_tool_async(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
        priority: Priority,
        callback: Callback,
    ) -> RequestId {
        self.submit(
            server,
            Operation::call_tool(tool, arguments),
            priority,
            None,
            callback,
        )
    }

    /// Submit a tools/list
    pub fn list_tools_async(&self, server: &str, priority: Priority, callback: Callback) -> RequestId {
        self.submit(server, Operation::ListTools, priority, None, callback)
    }

    /// Queue every request before draining once; `on_complete` runs for
    /// each of them
    pub fn call_parallel<F>(
        &self,
        requests: Vec<(String, Operation, Priority)>,
        on_complete: F,
    ) -> Vec<RequestId>
    where
        F: Fn(&RequestOutcome) + Send + Sync + 'static,
    {
        let on_complete = Arc::new(on_complete);
        let ids = requests
            .into_iter()
            .map(|(server, operation, priority)| {
                let on_complete = Arc::clone(&on_complete);
                self.enqueue(
                    &server,
                    operation,
                    priority,
                    None,
                    Box::new(move |outcome| on_complete(outcome)),
                )
            })
            .collect();
        self.process_queue();
        ids
    }

    // === Draining ===

    /// Dispatch queued requests in priority order until the queues are
    /// empty or the head request's server is at its limit. Returns the
    /// number of requests dispatched.
    pub fn process_queue(&self) -> usize {
        let mut dispatched = 0;
        let mut rejected = Vec::new();

        {
            let mut state = self.lock();
            while let Some((priority, id)) = state.pop_next() {
                let Some(server) = state.requests.get(&id).map(|r| r.server.clone()) else {
                    continue;
                };

                if !self.client.has_server(&server) {
                    let error = McpError::ServerNotFound(server.clone()).to_string();
                    warn!(request = %id, server = %server, "Request for unknown server");
                    rejected.extend(state.finish(id, RequestState::Failed, None, Some(error), Finisher::Caller));
                    continue;
                }

                let active = state.active.get(&server).copied().unwrap_or(0);
                if active >= self.config.max_concurrent_per_server {
                    state.queues[priority.index()].push_front(id);
                    break;
                }

                *state.active.entry(server.clone()).or_insert(0) += 1;
                let seq = state.next_seq;
                state.next_seq += 1;
                self.dispatch(&mut state, id, seq);
                dispatched += 1;
            }
        }

        for completion in rejected {
            completion.fire();
        }
        if dispatched > 0 {
            debug!(dispatched, "Dispatched queued requests");
        }
        dispatched
    }

    /// Mark `id` Dispatched and start its exchange task, arming the timer on
    /// first dispatch. Runs under the lock so the abort handles are stored
    /// before either task can observe the request.
    fn dispatch(&self, state: &mut DispatchState, id: RequestId, seq: u64) {
        let Some(request) = state.requests.get_mut(&id) else {
            return;
        };
        request.state = RequestState::Dispatched;
        request.dispatch_seq = Some(seq);

        let timeout = request.timeout;
        let deadline = *request
            .deadline
            .get_or_insert_with(|| Instant::now() + timeout);
        let server = request.server.clone();
        let operation = request.operation.clone();

        if request.timer.is_none() {
            let dispatcher = self.clone();
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                dispatcher.on_timeout(id);
            });
            request.timer = Some(timer.abort_handle());
        }

        let dispatcher = self.clone();
        let task = self.runtime.spawn(async move {
            dispatcher.run(id, server, operation, deadline).await;
        });
        request.task = Some(task.abort_handle());
    }

    /// Move a Dispatched request to Sending once its connection is held.
    /// False if it already finished.
    fn begin_send(&self, id: RequestId) -> bool {
        let mut state = self.lock();
        match state.requests.get_mut(&id) {
            Some(request) if request.state == RequestState::Dispatched => {
                request.state = RequestState::Sending;
                request.sent_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    fn mark_waiting(&self, id: RequestId) {
        if let Some(request) = self.lock().requests.get_mut(&id) {
            if request.state == RequestState::Sending {
                request.state = RequestState::Waiting;
            }
        }
    }

    async fn run(self, id: RequestId, server: String, operation: Operation, deadline: Instant) {
        let result = match &self.pool {
            Some(pool) => match pool.acquire(&server).await {
                Ok(Some(handle)) => {
                    let lease = Lease {
                        pool: Arc::clone(pool),
                        handle: Some(handle),
                    };
                    self.exchange_pooled(id, lease, &operation, deadline).await
                }
                Ok(None) => {
                    self.requeue(id);
                    return;
                }
                Err(e) => Some(Err(e)),
            },
            None => match self.client.connection(&server) {
                Ok(connection) => {
                    let mut conn = connection.lock().await;
                    if self.begin_send(id) {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        Some(
                            self.client
                                .execute(&mut conn, &operation, remaining, || self.mark_waiting(id))
                                .await,
                        )
                    } else {
                        None
                    }
                }
                Err(e) => Some(Err(e)),
            },
        };

        if let Some(result) = result {
            self.complete(id, result);
        }
    }

    async fn exchange_pooled(
        &self,
        id: RequestId,
        mut lease: Lease,
        operation: &Operation,
        deadline: Instant,
    ) -> Option<McpResult<Response>> {
        let connection = Arc::clone(lease.handle.as_ref()?.connection());
        let (result, broken) = {
            let mut conn = connection.lock().await;
            if !self.begin_send(id) {
                lease.give_back();
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self
                .client
                .execute(&mut conn, operation, remaining, || self.mark_waiting(id))
                .await;
            let broken = conn.is_interrupted() || result.as_ref().is_err_and(McpError::is_transport_failure);
            (result, broken)
        };

        if broken {
            lease.discard();
        } else {
            lease.give_back();
        }
        Some(result)
    }

    /// Put a dispatched request back at the head of its queue and schedule
    /// a redrain unless one is already pending. The timer keeps running
    /// against the original deadline.
    fn requeue(&self, id: RequestId) {
        {
            let mut state = self.lock();
            let Some(request) = state.requests.get_mut(&id) else {
                return;
            };
            request.state = RequestState::Queued;
            request.dispatch_seq = None;
            request.task = None;
            let server = request.server.clone();
            let priority = request.priority;

            state.release_slot(&server);
            state.queues[priority.index()].push_front(id);
            debug!(request = %id, server = %server, "Pool exhausted, request requeued");

            if state.redrain_scheduled {
                return;
            }
            state.redrain_scheduled = true;
        }

        let dispatcher = self.clone();
        let delay = self.config.requeue_delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.lock().redrain_scheduled = false;
            dispatcher.process_queue();
        });
    }

    fn complete(&self, id: RequestId, result: McpResult<Response>) {
        let (state, response, error) = match result {
            Ok(response) if response.success => (RequestState::Completed, Some(response), None),
            Ok(response) => {
                let error = response.error_message.clone();
                (RequestState::Failed, Some(response), error)
            }
            Err(e @ McpError::Timeout(_)) => (RequestState::Timeout, None, Some(e.to_string())),
            Err(e) => (RequestState::Failed, None, Some(e.to_string())),
        };

        let completion = self.lock().finish(id, state, response, error, Finisher::Task);
        self.settle(completion);
    }

    fn on_timeout(&self, id: RequestId) {
        let completion = {
            let mut state = self.lock();
            let timeout = state.requests.get(&id).map(|r| r.timeout);
            let completion = state.finish(
                id,
                RequestState::Timeout,
                None,
                timeout.map(|t| McpError::Timeout(t).to_string()),
                Finisher::Timer,
            );
            if let Some(completion) = &completion {
                warn!(request = %id, server = %completion.outcome.server, "Request timed out");
            }
            completion
        };
        self.settle(completion);
    }

    /// Fire a completion, wake waiters and refill freed slots
    fn settle(&self, completion: Option<Completion>) {
        if let Some(completion) = completion {
            debug!(
                request = %completion.outcome.id,
                state = ?completion.outcome.state,
                elapsed_ms = u64::try_from(completion.outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
                "Request finished"
            );
            completion.fire();
            self.shared.finished.notify_waiters();
        }
        self.process_queue();
    }

    // === Control ===

    /// Cancel a request that is queued, waiting for its connection, or
    /// waiting for its response
    ///
    /// # Errors
    /// `NotCancellable` while the request is being written, `NotFound` if it
    /// is unknown or already finished
    pub fn cancel(&self, id: RequestId) -> Result<(), DispatchError> {
        let completion = {
            let mut state = self.lock();
            let current = state
                .requests
                .get(&id)
                .map(|r| r.state)
                .ok_or(DispatchError::NotFound(id.value()))?;
            match current {
                RequestState::Queued | RequestState::Dispatched | RequestState::Waiting => state.finish(
                    id,
                    RequestState::Cancelled,
                    None,
                    Some("cancelled".to_string()),
                    Finisher::Caller,
                ),
                RequestState::Sending => return Err(DispatchError::NotCancellable(id.value())),
                _ => return Err(DispatchError::NotFound(id.value())),
            }
        };

        debug!(request = %id, "Request cancelled");
        self.settle(completion);
        Ok(())
    }

    /// Wait until every id in `ids` has reached a terminal state
    pub async fn wait_all(&self, ids: &[RequestId]) {
        loop {
            // Registered before the check so a finish in between is not missed
            let finished = self.shared.finished.notified();
            {
                let state = self.lock();
                if ids.iter().all(|id| !state.requests.contains_key(id)) {
                    return;
                }
            }
            self.process_queue();
            let _ = tokio::time::timeout(self.config.poll_interval, finished).await;
        }
    }

    /// Cancel everything still queued or in flight
    pub fn shutdown(&self) {
        let completions: Vec<Completion> = {
            let mut state = self.lock();
            let mut ids: Vec<RequestId> = state.requests.keys().copied().collect();
            ids.sort();
            ids.into_iter()
                .filter_map(|id| {
                    state.finish(
                        id,
                        RequestState::Cancelled,
                        None,
                        Some("dispatcher shut down".to_string()),
                        Finisher::Caller,
                    )
                })
                .collect()
        };

        info!(cancelled = completions.len(), "Async dispatcher shut down");
        for completion in completions {
            completion.fire();
        }
        self.shared.finished.notify_waiters();
    }

    // === Inspection ===

    /// Snapshot of a live request
    #[must_use]
    pub fn find(&self, id: RequestId) -> Option<RequestInfo> {
        let state = self.lock();
        state.requests.get(&id).map(|r| RequestInfo {
            id,
            server: r.server.clone(),
            operation: r.operation.label().to_string(),
            priority: r.priority,
            state: r.state,
            age: r.queued_at.elapsed(),
            timeout: r.timeout,
            dispatch_seq: r.dispatch_seq,
        })
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let state = self.lock();
        DispatcherStats {
            queue_depth: state.queue_depth(),
            active: state.active.values().sum(),
            ..state.stats.clone()
        }
    }

    /// Requests waiting in any queue
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.lock().queue_depth()
    }

    /// In-flight requests for `server`
    #[must_use]
    pub fn active_count(&self, server: &str) -> usize {
        self.lock().active.get(server).copied().unwrap_or(0)
    }
}

/// A pooled connection held by a running exchange. Dropping it without
/// giving it back (an aborted task) discards the connection.
struct Lease {
    pool: Arc<ConnectionPool>,
    handle: Option<PooledConnection>,
}

impl Lease {
    fn give_back(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }

    fn discard(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.discard(handle);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.discard();
    }
}
