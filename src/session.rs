//! The session controller: owns the worker, multiplexes callback-driven
//! requests over a strictly-ordered queue, and routes worker messages to the
//! task that asked for them.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::diagnostics;
use crate::doc;
use crate::expr::{self, ExpressionMatch, RESERVED_WORDS};
use crate::ipc::{ControllerIpcConnection, IpcTransport, Router, RouterEvent};
use crate::protocol::{
    Action, CompletionReply, ControllerFrame, ErrorReport, InspectionReply, InspectionReport,
    MimeBundle, RequestMessage, STATUS_ONLINE, WorkerMessage,
};
use crate::spawn::{ExitCallback, ExitSummary, ProcessLauncher, SpawnConfig, WorkerProcess,
    signal_number};
use crate::value::{Deferred, Thrown};

#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Spawn(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(err) => write!(f, "session io error: {err}"),
            SessionError::Spawn(message) => write!(f, "session spawn error: {message}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Io(err)
    }
}

/// Produces a live worker: a transport and, for process-backed workers, the
/// process handle.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> Result<WorkerLink, SessionError>;
}

pub struct WorkerLink {
    pub transport: IpcTransport,
    pub process: Option<WorkerProcess>,
}

/// Result payload delivered through `on_success`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Mime(MimeBundle),
    Completion(CompletionReply),
    Inspection(InspectionReply),
    Names(Vec<String>),
}

pub type SuccessCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;
pub type RunHook = Arc<dyn Fn() + Send + Sync>;
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type DisplayCallback = Arc<dyn Fn(&MimeBundle) + Send + Sync>;
pub type RequestCallback = Arc<dyn Fn(&RequestMessage, Option<ReplyHandle>) + Send + Sync>;

/// Per-task callback set. Every entry is optional.
#[derive(Clone, Default)]
pub struct TaskCallbacks {
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    pub before_run: Option<RunHook>,
    pub after_run: Option<RunHook>,
    pub on_stdout: Option<StreamCallback>,
    pub on_stderr: Option<StreamCallback>,
    pub on_display: Option<DisplayCallback>,
    pub on_request: Option<RequestCallback>,
}

/// Answers one input request. Writes a `reply` frame carrying the original
/// context and request ids, which are never exposed to the callback.
pub struct ReplyHandle {
    conn: ControllerIpcConnection,
    context_id: u64,
    request_id: u64,
}

impl ReplyHandle {
    pub fn reply(self, payload: serde_json::Value) {
        let frame = ControllerFrame::Reply {
            payload,
            id: self.context_id,
            request_id: self.request_id,
        };
        if self.conn.send(frame).is_err() {
            diagnostics::debug_log("input reply dropped; worker channel closed");
        }
    }
}

/// Code transform applied to `run` tasks before dispatch.
pub enum Transformed {
    Ready(String),
    Later(Deferred<String>),
}

pub type CodeTransform = Arc<dyn Fn(&str) -> Result<Transformed, Thrown> + Send + Sync>;
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SessionConfig {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub transform: Option<CodeTransform>,
    pub logger: Option<LogSink>,
}

impl SessionConfig {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            transform: None,
            logger: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Starting,
    Online,
    Dead,
}

struct TaskShared {
    action: Action,
    code: String,
    callbacks: TaskCallbacks,
}

struct SessionState {
    status: WorkerStatus,
    conn: Option<ControllerIpcConnection>,
    process: Option<WorkerProcess>,
    queue: VecDeque<Arc<TaskShared>>,
    contexts: HashMap<u64, Arc<TaskShared>>,
    displays: HashMap<String, Arc<TaskShared>>,
    last_task: Option<Arc<TaskShared>>,
    in_flight: Option<u64>,
    next_id: u64,
    transform: Option<CodeTransform>,
    logger: Option<LogSink>,
    /// Bumped on every spawn and teardown; events from a superseded worker
    /// carry a stale epoch and are ignored.
    epoch: u64,
}

/// A long-lived evaluation session. Cheap to clone; all clones share the same
/// worker and state. Call `shutdown` (or `kill`) to stop the worker.
#[derive(Clone)]
pub struct Session {
    state: Arc<Mutex<SessionState>>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Session, SessionError> {
        let state = Arc::new(Mutex::new(SessionState {
            status: WorkerStatus::Dead,
            conn: None,
            process: None,
            queue: VecDeque::new(),
            contexts: HashMap::new(),
            displays: HashMap::new(),
            last_task: None,
            in_flight: None,
            next_id: 0,
            transform: config.transform,
            logger: config.logger,
            epoch: 0,
        }));
        let session = Session {
            state,
            launcher: config.launcher,
        };
        spawn_worker(&session.state, &session.launcher)?;
        Ok(session)
    }

    /// Process-backed session from a spawn configuration.
    pub fn spawn(config: SpawnConfig) -> Result<Session, SessionError> {
        Session::new(SessionConfig::new(Arc::new(ProcessLauncher::new(config))))
    }

    /// Enqueues a `run` task.
    pub fn execute(&self, code: impl Into<String>, callbacks: TaskCallbacks) {
        self.submit(Action::Run, code.into(), callbacks);
    }

    /// Completion: parse locally, then enumerate the scope's properties on
    /// the worker and post-process. A null parse answers synchronously with
    /// an empty completion and never touches the worker.
    pub fn complete(&self, code: &str, cursor_pos: usize, callbacks: TaskCallbacks) {
        let Some(expression) = expr::parse(code, cursor_pos) else {
            deliver_sync(
                &callbacks,
                TaskResult::Completion(CompletionReply {
                    list: Vec::new(),
                    code: code.to_string(),
                    cursor_pos,
                    matched_text: String::new(),
                    cursor_start: cursor_pos,
                    cursor_end: cursor_pos,
                }),
            );
            return;
        };

        let scope_code = expression.scope.clone();
        let code_owned = code.to_string();
        let user_on_success = callbacks.on_success.clone();
        let internal = TaskCallbacks {
            on_success: Some(Arc::new(move |result: &TaskResult| {
                let TaskResult::Names(names) = result else {
                    return;
                };
                let reply = build_completion(&code_owned, cursor_pos, &expression, names);
                if let Some(cb) = &user_on_success {
                    cb(&TaskResult::Completion(reply));
                }
            })),
            ..callbacks
        };
        self.submit(Action::GetAllPropertyNames, scope_code, internal);
    }

    /// Inspection: parse locally, inspect the matched text on the worker,
    /// then resolve documentation (directly for global names, through a
    /// second inspection of the scope otherwise).
    pub fn inspect(&self, code: &str, cursor_pos: usize, callbacks: TaskCallbacks) {
        let Some(expression) = expr::parse(code, cursor_pos) else {
            deliver_sync(
                &callbacks,
                TaskResult::Inspection(InspectionReply {
                    report: InspectionReport::default(),
                    code: code.to_string(),
                    cursor_pos,
                    matched_text: String::new(),
                    doc: None,
                }),
            );
            return;
        };

        let session = self.clone();
        let expression = Arc::new(expression);
        let code_owned = code.to_string();
        let staged: Arc<Mutex<Option<InspectionReply>>> = Arc::new(Mutex::new(None));
        let continued = Arc::new(AtomicBool::new(false));

        let user_on_success = callbacks.on_success.clone();
        let user_after_run = callbacks.after_run.clone();
        let pass_through = callbacks.clone();

        let first_on_success: SuccessCallback = Arc::new({
            let expression = expression.clone();
            let staged = staged.clone();
            let continued = continued.clone();
            let user_on_success = user_on_success.clone();
            let user_after_run = user_after_run.clone();
            move |result: &TaskResult| {
                let TaskResult::Inspection(raw) = result else {
                    return;
                };
                let mut reply = InspectionReply {
                    report: raw.report.clone(),
                    code: code_owned.clone(),
                    cursor_pos,
                    matched_text: expression.matched_text.clone(),
                    doc: None,
                };

                if expression.scope.is_empty() {
                    reply.doc = doc::lookup(&expression.matched_text).cloned();
                    if let Some(cb) = &user_on_success {
                        cb(&TaskResult::Inspection(reply));
                    }
                    return;
                }

                // The direct lookup needs the scope's constructor chain:
                // issue a second inspection and probe the documentation table
                // along it.
                continued.store(true, Ordering::SeqCst);
                *staged.lock().expect("staged inspection mutex poisoned") = Some(reply);

                let selector = expression.selector.clone();
                let second = TaskCallbacks {
                    on_success: Some(Arc::new({
                        let staged = staged.clone();
                        let user_on_success = user_on_success.clone();
                        move |result: &TaskResult| {
                            let taken = staged
                                .lock()
                                .expect("staged inspection mutex poisoned")
                                .take();
                            let Some(mut reply) = taken else {
                                return;
                            };
                            if let TaskResult::Inspection(scope_raw) = result {
                                if let Some(constructors) = &scope_raw.report.constructor_list {
                                    for constructor in constructors {
                                        let name =
                                            format!("{constructor}.prototype.{selector}");
                                        if let Some(record) = doc::lookup(&name) {
                                            reply.doc = Some(record.clone());
                                            break;
                                        }
                                    }
                                }
                            }
                            if let Some(cb) = &user_on_success {
                                cb(&TaskResult::Inspection(reply));
                            }
                        }
                    })),
                    // A failed scope walk still delivers the inspection,
                    // just without documentation.
                    on_error: Some(Arc::new({
                        let staged = staged.clone();
                        let user_on_success = user_on_success.clone();
                        move |_report: &ErrorReport| {
                            let taken = staged
                                .lock()
                                .expect("staged inspection mutex poisoned")
                                .take();
                            if let Some(reply) = taken {
                                if let Some(cb) = &user_on_success {
                                    cb(&TaskResult::Inspection(reply));
                                }
                            }
                        }
                    })),
                    before_run: None,
                    after_run: user_after_run.clone(),
                    on_stdout: pass_through.on_stdout.clone(),
                    on_stderr: pass_through.on_stderr.clone(),
                    on_display: pass_through.on_display.clone(),
                    on_request: pass_through.on_request.clone(),
                };
                session.submit(Action::Inspect, expression.scope.clone(), second);
            }
        });

        let first = TaskCallbacks {
            on_success: Some(first_on_success),
            on_error: callbacks.on_error.clone(),
            before_run: callbacks.before_run.clone(),
            after_run: Some(Arc::new({
                let continued = continued.clone();
                let user_after_run = user_after_run.clone();
                move || {
                    if !continued.load(Ordering::SeqCst) {
                        if let Some(cb) = &user_after_run {
                            cb();
                        }
                    }
                }
            })),
            on_stdout: callbacks.on_stdout.clone(),
            on_stderr: callbacks.on_stderr.clone(),
            on_display: callbacks.on_display.clone(),
            on_request: callbacks.on_request.clone(),
        };
        self.submit(Action::Inspect, expression.matched_text.clone(), first);
    }

    /// Detaches from the worker and requests termination. The in-flight task,
    /// if any, is dropped without a result. `cb` fires with the exit summary.
    pub fn kill(&self, signal: Option<&str>, cb: Option<ExitCallback>) {
        self.kill_inner(signal, cb);
    }

    /// Kill, reinitialize controller state (queued tasks do not survive),
    /// respawn. `cb` fires with the old worker's exit summary once the new
    /// worker has been spawned.
    pub fn restart(&self, signal: Option<&str>, cb: Option<ExitCallback>) {
        {
            let mut state = self.lock_state();
            state.queue.clear();
            state.last_task = None;
            state.displays.clear();
        }
        let session = self.clone();
        self.kill_inner(
            signal,
            Some(Box::new(move |summary| {
                if let Err(err) = spawn_worker(&session.state, &session.launcher) {
                    diagnostics::debug_log(format!("restart spawn failed: {err}"));
                }
                if let Some(cb) = cb {
                    cb(summary);
                }
            })),
        );
    }

    /// Best-effort teardown for hosts done with the session.
    pub fn shutdown(&self) {
        self.kill_inner(None, None);
    }

    pub fn set_code_transform(&self, transform: Option<CodeTransform>) {
        self.lock_state().transform = transform;
    }

    pub fn set_logger(&self, logger: Option<LogSink>) {
        self.lock_state().logger = logger;
    }

    fn submit(&self, action: Action, code: String, callbacks: TaskCallbacks) {
        let task = Arc::new(TaskShared {
            action,
            code,
            callbacks,
        });
        let epoch = {
            let mut state = self.lock_state();
            if state.status == WorkerStatus::Dead {
                diagnostics::debug_log("dropping task; worker is dead");
                return;
            }
            state.queue.push_back(task);
            state.epoch
        };
        dispatch_next(&self.state, epoch);
    }

    fn kill_inner(&self, signal: Option<&str>, continuation: Option<ExitCallback>) {
        let (process, conn) = {
            let mut state = self.lock_state();
            state.epoch += 1;
            state.status = WorkerStatus::Dead;
            state.in_flight = None;
            state.contexts.clear();
            (state.process.take(), state.conn.take())
        };
        // Dropping the connection closes the worker's stdin-side pipe; a
        // worker without a process handle (thread-backed) exits on that EOF.
        drop(conn);
        match process {
            Some(process) => {
                if let Some(continuation) = continuation {
                    process.set_exit_handler(continuation);
                }
                if let Err(err) = process.kill(signal_number(signal)) {
                    diagnostics::debug_log(format!("worker kill failed: {err}"));
                }
            }
            None => {
                if let Some(continuation) = continuation {
                    continuation(ExitSummary::default());
                }
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state mutex poisoned")
    }
}

fn spawn_worker(
    state: &Arc<Mutex<SessionState>>,
    launcher: &Arc<dyn WorkerLauncher>,
) -> Result<(), SessionError> {
    let epoch = {
        let mut guard = state.lock().expect("session state mutex poisoned");
        guard.epoch += 1;
        guard.status = WorkerStatus::Starting;
        guard.epoch
    };

    let link = match launcher.launch() {
        Ok(link) => link,
        Err(err) => {
            if let Some(mut guard) = lock_epoch(state, epoch) {
                guard.status = WorkerStatus::Dead;
            }
            return Err(err);
        }
    };

    let router = router_for(state.clone(), epoch);
    let conn = ControllerIpcConnection::new(link.transport, router);

    {
        let mut guard = state.lock().expect("session state mutex poisoned");
        if guard.epoch != epoch {
            return Ok(());
        }
        guard.conn = Some(conn);
        guard.process = link.process;
        if let Some(process) = &guard.process {
            process.set_exit_handler(default_exit_handler(state.clone(), epoch));
        }
    }
    // The online announcement may already have been routed before the
    // connection landed in the state; run the queue head if so.
    dispatch_next(state, epoch);
    Ok(())
}

fn default_exit_handler(state: Arc<Mutex<SessionState>>, epoch: u64) -> ExitCallback {
    Box::new(move |summary| {
        let Some(mut guard) = lock_epoch(&state, epoch) else {
            return;
        };
        diagnostics::debug_log(format!(
            "worker exited unexpectedly (code {:?}, signal {:?})",
            summary.code, summary.signal
        ));
        guard.status = WorkerStatus::Dead;
        guard.conn = None;
        guard.process = None;
        guard.in_flight = None;
        guard.contexts.clear();
    })
}

fn router_for(state: Arc<Mutex<SessionState>>, epoch: u64) -> Router {
    Arc::new(move |event| match event {
        RouterEvent::Message(message) => route_message(&state, epoch, message),
        RouterEvent::Disconnected => {
            let Some(mut guard) = lock_epoch(&state, epoch) else {
                return;
            };
            diagnostics::debug_log("worker channel disconnected");
            guard.status = WorkerStatus::Dead;
            guard.conn = None;
            guard.in_flight = None;
            guard.contexts.clear();
        }
    })
}

fn lock_epoch<'a>(
    state: &'a Arc<Mutex<SessionState>>,
    epoch: u64,
) -> Option<MutexGuard<'a, SessionState>> {
    let guard = state.lock().expect("session state mutex poisoned");
    (guard.epoch == epoch).then_some(guard)
}

fn resolve_owner(state: &SessionState, id: Option<u64>) -> Option<Arc<TaskShared>> {
    id.and_then(|id| state.contexts.get(&id).cloned())
        .or_else(|| state.last_task.clone())
}

/// Routes one inbound message in the spec's precedence order. User callbacks
/// are always invoked with the state lock released.
fn route_message(state: &Arc<Mutex<SessionState>>, epoch: u64, mut message: WorkerMessage) {
    let id = message.id.take();
    let end = std::mem::take(&mut message.end);

    if let Some(line) = message.log.take() {
        let logger = match lock_epoch(state, epoch) {
            Some(guard) => guard.logger.clone(),
            None => return,
        };
        match logger {
            Some(logger) => logger(&line),
            None => diagnostics::debug_log(line),
        }
        return;
    }

    if let Some(status) = message.status.take() {
        if status == STATUS_ONLINE {
            {
                let Some(mut guard) = lock_epoch(state, epoch) else {
                    return;
                };
                guard.status = WorkerStatus::Online;
            }
            dispatch_next(state, epoch);
        }
        return;
    }

    if let Some(display) = message.display.take() {
        if let Some(opened) = display.open {
            let Some(mut guard) = lock_epoch(state, epoch) else {
                return;
            };
            if let Some(owner) = resolve_owner(&guard, id) {
                guard.displays.insert(opened, owner);
            }
            return;
        }
        if let Some(bundle) = display.mime {
            let owner = {
                let Some(guard) = lock_epoch(state, epoch) else {
                    return;
                };
                display
                    .display_id
                    .as_ref()
                    .and_then(|display_id| guard.displays.get(display_id).cloned())
                    .or_else(|| resolve_owner(&guard, id))
            };
            if let Some(owner) = owner {
                if let Some(cb) = &owner.callbacks.on_display {
                    cb(&bundle);
                }
            }
            return;
        }
        if let Some(closed) = display.close {
            if let Some(mut guard) = lock_epoch(state, epoch) {
                guard.displays.remove(&closed);
            }
        }
        return;
    }

    if let Some(mut request) = message.request.take() {
        let (owner, conn) = {
            let Some(guard) = lock_epoch(state, epoch) else {
                return;
            };
            (resolve_owner(&guard, id), guard.conn.clone())
        };
        let Some(owner) = owner else {
            return;
        };
        let Some(cb) = &owner.callbacks.on_request else {
            return;
        };
        if request.clear.is_some() {
            cb(&request, None);
            return;
        }
        let request_id = request.id.take();
        let reply = match (request_id, id, conn) {
            (Some(request_id), Some(context_id), Some(conn)) => Some(ReplyHandle {
                conn,
                context_id,
                request_id,
            }),
            _ => None,
        };
        cb(&request, reply);
        return;
    }

    if let Some(chunk) = message.stdout.take() {
        deliver_stream(state, epoch, id, &chunk, true);
        return;
    }
    if let Some(chunk) = message.stderr.take() {
        deliver_stream(state, epoch, id, &chunk, false);
        return;
    }

    // Result payloads route strictly by live context id: the owning task
    // terminates exactly once, so a result for a dead id has nowhere to go.
    let task = {
        let Some(guard) = lock_epoch(state, epoch) else {
            return;
        };
        id.and_then(|id| guard.contexts.get(&id).cloned())
    };

    if let Some(report) = message.error.take() {
        match &task {
            Some(task) => {
                if let Some(cb) = &task.callbacks.on_error {
                    cb(&report);
                }
            }
            None => diagnostics::debug_log(format!("error result for dead context {id:?}")),
        }
    } else if let Some(result) = success_payload(&mut message) {
        match &task {
            Some(task) => {
                if let Some(cb) = &task.callbacks.on_success {
                    cb(&result);
                }
            }
            None => diagnostics::debug_log(format!("result for dead context {id:?}")),
        }
    }

    if end {
        let (ended, was_in_flight) = {
            let Some(mut guard) = lock_epoch(state, epoch) else {
                return;
            };
            let ended = id.and_then(|id| guard.contexts.remove(&id));
            let was_in_flight = id.is_some() && guard.in_flight == id;
            if was_in_flight {
                guard.in_flight = None;
            }
            (ended, was_in_flight)
        };
        if let Some(task) = ended {
            if let Some(cb) = &task.callbacks.after_run {
                cb();
            }
        }
        if was_in_flight {
            dispatch_next(state, epoch);
        }
    }
}

fn success_payload(message: &mut WorkerMessage) -> Option<TaskResult> {
    if let Some(bundle) = message.mime.take() {
        return Some(TaskResult::Mime(bundle));
    }
    if let Some(completion) = message.completion.take() {
        return Some(TaskResult::Completion(completion));
    }
    if let Some(report) = message.inspection.take() {
        return Some(TaskResult::Inspection(InspectionReply {
            report,
            ..InspectionReply::default()
        }));
    }
    message.names.take().map(TaskResult::Names)
}

fn deliver_stream(
    state: &Arc<Mutex<SessionState>>,
    epoch: u64,
    id: Option<u64>,
    chunk: &str,
    is_stdout: bool,
) {
    let owner = {
        let Some(guard) = lock_epoch(state, epoch) else {
            return;
        };
        resolve_owner(&guard, id)
    };
    let Some(owner) = owner else {
        return;
    };
    let cb = if is_stdout {
        &owner.callbacks.on_stdout
    } else {
        &owner.callbacks.on_stderr
    };
    if let Some(cb) = cb {
        cb(chunk);
    }
}

/// Runs the queue head when the worker is online and idle: allocate the next
/// context id, record the task, fire `before_run`, apply the code transform,
/// emit the frame.
fn dispatch_next(state: &Arc<Mutex<SessionState>>, epoch: u64) {
    let (task, id, conn, transform) = {
        let Some(mut guard) = lock_epoch(state, epoch) else {
            return;
        };
        if guard.status != WorkerStatus::Online
            || guard.in_flight.is_some()
            || guard.conn.is_none()
        {
            return;
        }
        let Some(task) = guard.queue.pop_front() else {
            return;
        };
        guard.next_id += 1;
        let id = guard.next_id;
        guard.contexts.insert(id, task.clone());
        guard.last_task = Some(task.clone());
        guard.in_flight = Some(id);
        (task, id, guard.conn.clone(), guard.transform.clone())
    };

    if let Some(cb) = &task.callbacks.before_run {
        cb();
    }

    match (task.action, transform) {
        (Action::Run, Some(transform)) => match transform(&task.code) {
            Ok(Transformed::Ready(code)) => send_frame(state, epoch, conn, task.action, code, id),
            Ok(Transformed::Later(deferred)) => {
                let thread_state = state.clone();
                let action = task.action;
                let spawned = thread::Builder::new()
                    .name("repl-session-transform".to_string())
                    .spawn(move || match deferred.wait() {
                        Ok(code) => send_frame(&thread_state, epoch, conn, action, code, id),
                        Err(thrown) => synthesize_error(&thread_state, epoch, id, thrown),
                    });
                if let Err(err) = spawned {
                    synthesize_error(
                        state,
                        epoch,
                        id,
                        Thrown::new("Error", format!("failed to spawn transform thread: {err}")),
                    );
                }
            }
            Err(thrown) => synthesize_error(state, epoch, id, thrown),
        },
        _ => send_frame(state, epoch, conn, task.action, task.code.clone(), id),
    }
}

fn send_frame(
    state: &Arc<Mutex<SessionState>>,
    epoch: u64,
    conn: Option<ControllerIpcConnection>,
    action: Action,
    code: String,
    id: u64,
) {
    let Some(conn) = conn else {
        synthesize_error(
            state,
            epoch,
            id,
            Thrown::new("Error", "worker channel unavailable"),
        );
        return;
    };
    if conn
        .send(ControllerFrame::Request { action, code, id })
        .is_err()
    {
        synthesize_error(state, epoch, id, Thrown::new("Error", "worker channel closed"));
    }
}

/// A failure on the controller side gets the same shape as a worker-produced
/// error and flows through the normal routing path.
fn synthesize_error(state: &Arc<Mutex<SessionState>>, epoch: u64, id: u64, thrown: Thrown) {
    let message = WorkerMessage::error(id, ErrorReport::from_thrown(&thrown), true);
    route_message(state, epoch, message);
}

fn deliver_sync(callbacks: &TaskCallbacks, result: TaskResult) {
    if let Some(cb) = &callbacks.before_run {
        cb();
    }
    if let Some(cb) = &callbacks.on_success {
        cb(&result);
    }
    if let Some(cb) = &callbacks.after_run {
        cb();
    }
}

/// Completion post-processing: union reserved words at global scope, filter
/// by the selector prefix, re-prefix with the scope accessors, and compute
/// the replacement span.
fn build_completion(
    code: &str,
    cursor_pos: usize,
    expression: &ExpressionMatch,
    names: &[String],
) -> CompletionReply {
    let mut candidates: Vec<String> = names.to_vec();
    if expression.scope.is_empty() {
        candidates.extend(RESERVED_WORDS.iter().map(|word| word.to_string()));
    }
    candidates.retain(|candidate| candidate.starts_with(&expression.selector));
    candidates.sort();
    candidates.dedup();

    let left = format!("{}{}", expression.scope, expression.left_op);
    let right = &expression.right_op;
    let list: Vec<String> = if left.is_empty() && right.is_empty() {
        candidates
    } else {
        candidates
            .iter()
            .map(|candidate| format!("{left}{candidate}{right}"))
            .collect()
    };

    let cursor_start = code.find(&expression.matched_text).unwrap_or(0);
    let mut cursor_end = cursor_start + expression.matched_text.len();
    if let Some(shortest) = list.iter().min_by_key(|candidate| candidate.len()) {
        let code_bytes = code.as_bytes();
        let shortest_bytes = shortest.as_bytes();
        cursor_end = cursor_start;
        for i in 0..shortest_bytes.len() {
            if cursor_end >= code_bytes.len() {
                break;
            }
            if code_bytes[cursor_end] != shortest_bytes[i] {
                break;
            }
            cursor_end += 1;
        }
    }

    CompletionReply {
        list,
        code: code.to_string(),
        cursor_pos,
        matched_text: expression.matched_text.clone(),
        cursor_start,
        cursor_end,
    }
}
