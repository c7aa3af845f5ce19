//! The evaluator worker: one request at a time, a capture frame around each
//! evaluation, normalized messages back to the controller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

use crate::capture;
use crate::helpers::{Helpers, MimerSlot, PendingInputs, panic_message};
use crate::inspect;
use crate::ipc::{IpcTransport, WorkerIpcConnection, connect_from_env};
use crate::protocol::{Action, ControllerFrame, WorkerMessage};
use crate::session::{SessionError, WorkerLauncher, WorkerLink};
use crate::value::{EvalOutcome, Evaluator, Eventual, Thrown};

pub const WORKER_MODE_ARG: &str = "worker";

/// True when the current process was launched as a worker (`worker` or
/// `--worker` on the command line).
pub fn is_worker_mode() -> bool {
    std::env::args().any(|arg| arg == WORKER_MODE_ARG || arg == format!("--{WORKER_MODE_ARG}"))
}

/// Worker-process entry point: adopt the inherited pipe fds and serve until
/// the controller goes away.
pub fn run(evaluator: Box<dyn Evaluator>) -> Result<(), Box<dyn std::error::Error>> {
    crate::diagnostics::debug_log("worker: run begin");
    let transport = connect_from_env()?;
    run_with(transport, evaluator)
}

/// Serves requests over the given transport. Returns when the controller end
/// closes. Used directly by thread-backed workers and tests.
pub fn run_with(
    transport: IpcTransport,
    evaluator: Box<dyn Evaluator>,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn = WorkerIpcConnection::new(transport);
    let mut worker = Worker {
        conn: conn.clone(),
        evaluator,
        pending_inputs: PendingInputs::default(),
        mimer: MimerSlot::default(),
    };
    conn.send(WorkerMessage::status_online())?;
    worker.run_loop();
    Ok(())
}

struct Worker {
    conn: WorkerIpcConnection,
    evaluator: Box<dyn Evaluator>,
    pending_inputs: PendingInputs,
    mimer: MimerSlot,
}

impl Worker {
    fn run_loop(&mut self) {
        while let Some(frame) = self.conn.recv(None) {
            self.handle_frame(frame);
        }
        crate::diagnostics::debug_log("worker: ipc disconnected; exiting");
    }

    fn handle_frame(&mut self, frame: ControllerFrame) {
        match frame {
            ControllerFrame::Request { action, code, id } => self.handle_request(action, code, id),
            ControllerFrame::Reply {
                payload,
                id,
                request_id,
            } => self.pending_inputs.resolve(id, request_id, payload),
            ControllerFrame::Unknown { action, id } => match id {
                Some(id) => {
                    let helpers = self.context(id);
                    helpers.send_error(Thrown::new("Error", format!("unknown action: {action}")), false);
                }
                None => {
                    crate::diagnostics::debug_log(format!(
                        "unknown action without a context id: {action}"
                    ));
                }
            },
        }
    }

    fn context(&self, id: u64) -> Helpers {
        Helpers::new(
            id,
            self.conn.clone(),
            self.pending_inputs.clone(),
            self.mimer.clone(),
        )
    }

    fn handle_request(&mut self, action: Action, code: String, id: u64) {
        let helpers = self.context(id);
        capture::install(id, self.conn.clone());

        let evaluator = &mut self.evaluator;
        let outcome = catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&code, &helpers)));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            // A panic inside the synchronous evaluation still has to
            // terminate the request exactly once.
            Err(panic) => Err(Thrown::new("InternalError", panic_message(&panic))),
        };

        match action {
            Action::Run => finish_run(&helpers, outcome),
            Action::Inspect => finish_with_value(&helpers, outcome, |helpers, value| {
                helpers.emit_inspection(inspect::inspect(&value));
            }),
            Action::GetAllPropertyNames => finish_with_value(&helpers, outcome, |helpers, value| {
                helpers.emit_names(inspect::all_property_names(&value));
            }),
        }
    }
}

fn finish_run(helpers: &Helpers, outcome: Result<EvalOutcome, Thrown>) {
    match outcome {
        Err(thrown) => helpers.send_error(thrown, false),
        Ok(EvalOutcome::Deferred(deferred)) => {
            // Awaited off-loop so reply frames stay serviceable; fulfillment
            // is the result, rejection the error.
            helpers.send_result(deferred, false);
        }
        Ok(EvalOutcome::Value(value)) => {
            if !helpers.is_async() && !helpers.is_done() {
                helpers.send_result(value, false);
            }
        }
    }
}

fn finish_with_value(
    helpers: &Helpers,
    outcome: Result<EvalOutcome, Thrown>,
    deliver: impl FnOnce(&Helpers, crate::value::ValueRef) + Send + 'static,
) {
    match outcome {
        Err(thrown) => helpers.send_error(thrown, false),
        Ok(EvalOutcome::Value(value)) => deliver(helpers, value),
        Ok(EvalOutcome::Deferred(deferred)) => {
            helpers.with_value(Eventual::Later(deferred), deliver);
        }
    }
}

/// Runs the worker loop on an in-process thread over piped transports.
/// The launcher the integration tests use, and a convenient embedding for
/// hosts that do not need process isolation.
pub struct ThreadLauncher {
    factory: Arc<dyn Fn() -> Box<dyn Evaluator> + Send + Sync>,
}

impl ThreadLauncher {
    pub fn new(factory: impl Fn() -> Box<dyn Evaluator> + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self) -> Result<WorkerLink, SessionError> {
        let (controller_transport, worker_transport) = IpcTransport::pair()?;
        let factory = self.factory.clone();
        thread::Builder::new()
            .name("repl-worker".to_string())
            .spawn(move || {
                if let Err(err) = run_with(worker_transport, factory()) {
                    crate::diagnostics::debug_log(format!("worker thread exited with error: {err}"));
                }
            })
            .map_err(SessionError::Io)?;
        Ok(WorkerLink {
            transport: controller_transport,
            process: None,
        })
    }
}
