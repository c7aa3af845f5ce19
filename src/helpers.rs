//! The user-facing helper namespace exposed to evaluated code.
//!
//! One `Helpers` exists per context. It is cheap to clone and `Send`, so user
//! code may hand it to timers and callbacks; emissions after the synchronous
//! end of evaluation are exactly how async requests finish.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::capture::{self, Console};
use crate::ipc::WorkerIpcConnection;
use crate::mime::{self, Mimer};
use crate::protocol::{
    APPLICATION_JSON, ClearOptions, DisplayMessage, ErrorReport, IMAGE_JPEG, IMAGE_PNG, IMAGE_SVG,
    InputOptions, InspectionReport, MimeBundle, RequestMessage, TEXT_HTML, TEXT_PLAIN,
    WorkerMessage,
};
use crate::value::{Deferred, Eventual, Thrown, ValueRef};

pub type InputCallback = Box<dyn FnOnce(serde_json::Value) + Send>;

struct PendingInput {
    callback: Option<InputCallback>,
    handle: crate::value::DeferredHandle<serde_json::Value>,
}

/// Worker-global registry of prompts awaiting a `reply` frame, keyed by
/// `(context id, request id)`.
#[derive(Clone, Default)]
pub(crate) struct PendingInputs {
    inner: Arc<Mutex<HashMap<(u64, u64), PendingInput>>>,
}

impl PendingInputs {
    fn register(
        &self,
        context_id: u64,
        request_id: u64,
        callback: Option<InputCallback>,
        handle: crate::value::DeferredHandle<serde_json::Value>,
    ) {
        let mut inner = self.inner.lock().expect("pending input mutex poisoned");
        inner.insert((context_id, request_id), PendingInput { callback, handle });
    }

    /// Delivers a reply to the matching continuation. Unknown ids are dropped.
    pub(crate) fn resolve(&self, context_id: u64, request_id: u64, payload: serde_json::Value) {
        let pending = {
            let mut inner = self.inner.lock().expect("pending input mutex poisoned");
            inner.remove(&(context_id, request_id))
        };
        let Some(mut pending) = pending else {
            crate::diagnostics::debug_log(format!(
                "reply for unknown input request {context_id}/{request_id}"
            ));
            return;
        };
        if let Some(callback) = pending.callback.take() {
            callback(payload.clone());
        }
        pending.handle.resolve(payload);
    }
}

/// Worker-global slot for the user-installed mimer.
#[derive(Clone, Default)]
pub(crate) struct MimerSlot {
    inner: Arc<Mutex<Option<Mimer>>>,
}

impl MimerSlot {
    fn get(&self) -> Option<Mimer> {
        self.inner.lock().expect("mimer mutex poisoned").clone()
    }

    fn set(&self, mimer: Option<Mimer>) {
        *self.inner.lock().expect("mimer mutex poisoned") = mimer;
    }
}

struct ContextShared {
    id: u64,
    conn: WorkerIpcConnection,
    async_flag: AtomicBool,
    done: AtomicBool,
    next_request_id: AtomicU64,
    pending_inputs: PendingInputs,
    mimer: MimerSlot,
}

/// Helper namespace for one context.
#[derive(Clone)]
pub struct Helpers {
    shared: Arc<ContextShared>,
}

impl Helpers {
    pub(crate) fn new(
        id: u64,
        conn: WorkerIpcConnection,
        pending_inputs: PendingInputs,
        mimer: MimerSlot,
    ) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                id,
                conn,
                async_flag: AtomicBool::new(false),
                done: AtomicBool::new(false),
                next_request_id: AtomicU64::new(0),
                pending_inputs,
                mimer,
            }),
        }
    }

    pub fn context_id(&self) -> u64 {
        self.shared.id
    }

    /// Extends the context past the synchronous end of evaluation. Returns
    /// the new flag value.
    pub fn set_async(&self, value: bool) -> bool {
        self.shared.async_flag.store(value, Ordering::SeqCst);
        value
    }

    pub fn is_async(&self) -> bool {
        self.shared.async_flag.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Finalizes the request without a result payload.
    pub fn done(&self) {
        self.emit(WorkerMessage::default(), true);
    }

    /// Finalizes the request with a result, serialized through the MIME
    /// encoder.
    pub fn done_with(&self, value: impl Into<Eventual<ValueRef>>) {
        self.send_result(value, false);
    }

    /// Encodes and sends a result. `keep_alive` makes it non-terminal.
    pub fn send_result(&self, value: impl Into<Eventual<ValueRef>>, keep_alive: bool) {
        self.resolve(value.into(), move |helpers, value| {
            let bundle = mime::encode(&value, helpers.shared.mimer.get().as_ref());
            helpers.emit(
                WorkerMessage {
                    mime: Some(bundle),
                    ..WorkerMessage::default()
                },
                !keep_alive,
            );
        });
    }

    /// Formats and sends an error. Terminal unless `keep_alive`.
    pub fn send_error(&self, error: Thrown, keep_alive: bool) {
        self.emit(
            WorkerMessage {
                error: Some(ErrorReport::from_thrown(&error)),
                ..WorkerMessage::default()
            },
            !keep_alive,
        );
    }

    /// Sends a prepared MIME bundle.
    pub fn mime(&self, bundle: impl Into<Eventual<MimeBundle>>, keep_alive: bool) {
        self.resolve(bundle.into(), move |helpers, bundle| {
            helpers.emit(
                WorkerMessage {
                    mime: Some(bundle),
                    ..WorkerMessage::default()
                },
                !keep_alive,
            );
        });
    }

    pub fn text(&self, payload: impl Into<Eventual<String>>, keep_alive: bool) {
        self.send_typed(TEXT_PLAIN, payload.into(), keep_alive);
    }

    pub fn html(&self, payload: impl Into<Eventual<String>>, keep_alive: bool) {
        self.send_typed(TEXT_HTML, payload.into(), keep_alive);
    }

    pub fn svg(&self, payload: impl Into<Eventual<String>>, keep_alive: bool) {
        self.send_typed(IMAGE_SVG, payload.into(), keep_alive);
    }

    pub fn json(&self, payload: impl Into<Eventual<String>>, keep_alive: bool) {
        self.send_typed(APPLICATION_JSON, payload.into(), keep_alive);
    }

    pub fn png(&self, data: impl Into<Eventual<Vec<u8>>>, keep_alive: bool) {
        self.resolve(data.into(), move |helpers, data| {
            helpers.mime(single(IMAGE_PNG, STANDARD.encode(data)), keep_alive);
        });
    }

    pub fn jpeg(&self, data: impl Into<Eventual<Vec<u8>>>, keep_alive: bool) {
        self.resolve(data.into(), move |helpers, data| {
            helpers.mime(single(IMAGE_JPEG, STANDARD.encode(data)), keep_alive);
        });
    }

    /// Issues a prompt request to the client. Auto-sets the async flag; the
    /// returned deferred settles with the raw reply payload, as does the
    /// optional callback. The request stays live until user code finalizes.
    pub fn input(
        &self,
        options: InputOptions,
        callback: Option<InputCallback>,
    ) -> Deferred<serde_json::Value> {
        self.set_async(true);
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (handle, deferred) = Deferred::pending();
        self.shared
            .pending_inputs
            .register(self.shared.id, request_id, callback, handle);
        self.emit(
            WorkerMessage {
                request: Some(RequestMessage {
                    input: Some(options),
                    clear: None,
                    id: Some(request_id),
                }),
                ..WorkerMessage::default()
            },
            false,
        );
        deferred
    }

    /// Sends a clear-output request. Expects no reply.
    pub fn clear(&self, options: ClearOptions) {
        self.emit(
            WorkerMessage {
                request: Some(RequestMessage {
                    input: None,
                    clear: Some(options),
                    id: None,
                }),
                ..WorkerMessage::default()
            },
            false,
        );
    }

    /// Creates a display handle. With an id the open message is emitted
    /// immediately so later requests can address the display.
    pub fn display(&self, display_id: Option<&str>) -> DisplayHandle {
        let handle = DisplayHandle {
            helpers: self.clone(),
            display_id: display_id.map(str::to_string),
        };
        if let Some(id) = &handle.display_id {
            self.emit(
                WorkerMessage {
                    display: Some(DisplayMessage {
                        open: Some(id.clone()),
                        ..DisplayMessage::default()
                    }),
                    ..WorkerMessage::default()
                },
                false,
            );
        }
        handle
    }

    /// Installs (or clears) the user mimer. Persists across contexts.
    pub fn set_mimer(&self, mimer: Option<Mimer>) {
        self.shared.mimer.set(mimer);
    }

    /// Console bound to this context's captured streams.
    pub fn console(&self) -> Console {
        Console::new(self.shared.id, self.shared.conn.clone())
    }

    /// Worker-internal: settle a possibly-deferred value and hand it to
    /// `deliver` under the usual async/rejection rules.
    pub(crate) fn with_value(
        &self,
        value: Eventual<ValueRef>,
        deliver: impl FnOnce(&Helpers, ValueRef) + Send + 'static,
    ) {
        self.resolve(value, deliver);
    }

    pub(crate) fn emit_inspection(&self, report: InspectionReport) {
        self.emit(
            WorkerMessage {
                inspection: Some(report),
                ..WorkerMessage::default()
            },
            true,
        );
    }

    pub(crate) fn emit_names(&self, names: Vec<String>) {
        self.emit(
            WorkerMessage {
                names: Some(names),
                ..WorkerMessage::default()
            },
            true,
        );
    }

    fn send_typed(&self, content_type: &'static str, payload: Eventual<String>, keep_alive: bool) {
        self.resolve(payload, move |helpers, payload| {
            helpers.mime(single(content_type, payload), keep_alive);
        });
    }

    /// Runs `deliver` with the settled value. A deferred flips the context to
    /// async and settles on a helper thread; rejection becomes a terminal
    /// error.
    fn resolve<T: Send + 'static>(
        &self,
        value: Eventual<T>,
        deliver: impl FnOnce(&Helpers, T) + Send + 'static,
    ) {
        match value {
            Eventual::Now(value) => deliver(self, value),
            Eventual::Later(deferred) => {
                self.set_async(true);
                let helpers = self.clone();
                let spawned = thread::Builder::new()
                    .name("repl-worker-deferred".to_string())
                    .spawn(move || {
                        let outcome = catch_unwind(AssertUnwindSafe(|| match deferred.wait() {
                            Ok(value) => deliver(&helpers, value),
                            Err(thrown) => helpers.send_error(thrown, false),
                        }));
                        if let Err(panic) = outcome {
                            helpers.report_uncaught(panic);
                        }
                    });
                if let Err(err) = spawned {
                    self.send_error(
                        Thrown::new("Error", format!("failed to spawn helper thread: {err}")),
                        false,
                    );
                }
            }
        }
    }

    /// Worker-scope uncaught exception: streamed as stderr, not a result.
    fn report_uncaught(&self, panic: Box<dyn std::any::Any + Send>) {
        let message = panic_message(&panic);
        let _ = self.shared.conn.send(WorkerMessage {
            stderr: Some(format!("Uncaught exception: {message}\n")),
            ..WorkerMessage::default()
        });
    }

    fn emit(&self, mut message: WorkerMessage, terminal: bool) {
        message.id = Some(self.shared.id);
        if terminal {
            // First terminal send wins; anything later is a double
            // finalization and is suppressed.
            if self.shared.done.swap(true, Ordering::SeqCst) {
                return;
            }
            message.end = true;
            let _ = self.shared.conn.send(message);
            capture::release(self.shared.id);
        } else {
            let _ = self.shared.conn.send(message);
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic of unknown type".to_string()
    }
}

fn single(content_type: &str, payload: String) -> MimeBundle {
    let mut bundle = MimeBundle::new();
    bundle.insert(content_type.to_string(), payload);
    bundle
}

/// Named, updatable output slot. Updates route to whichever request owns the
/// display id at the time, letting later executions refresh earlier output.
pub struct DisplayHandle {
    helpers: Helpers,
    display_id: Option<String>,
}

impl DisplayHandle {
    pub fn id(&self) -> Option<&str> {
        self.display_id.as_deref()
    }

    pub fn mime(&self, bundle: impl Into<Eventual<MimeBundle>>) {
        let display = self.clone_parts();
        self.helpers.resolve(bundle.into(), move |_, bundle| {
            display.emit_mime(bundle);
        });
    }

    pub fn text(&self, payload: impl Into<Eventual<String>>) {
        self.send_typed(TEXT_PLAIN, payload.into());
    }

    pub fn html(&self, payload: impl Into<Eventual<String>>) {
        self.send_typed(TEXT_HTML, payload.into());
    }

    pub fn svg(&self, payload: impl Into<Eventual<String>>) {
        self.send_typed(IMAGE_SVG, payload.into());
    }

    pub fn json(&self, payload: impl Into<Eventual<String>>) {
        self.send_typed(APPLICATION_JSON, payload.into());
    }

    pub fn png(&self, data: impl Into<Eventual<Vec<u8>>>) {
        let display = self.clone_parts();
        self.helpers.resolve(data.into(), move |_, data| {
            display.emit_mime(single(IMAGE_PNG, STANDARD.encode(data)));
        });
    }

    pub fn jpeg(&self, data: impl Into<Eventual<Vec<u8>>>) {
        let display = self.clone_parts();
        self.helpers.resolve(data.into(), move |_, data| {
            display.emit_mime(single(IMAGE_JPEG, STANDARD.encode(data)));
        });
    }

    /// Closes the display. A handle without an id has nothing to close.
    pub fn close(&self) {
        let Some(id) = &self.display_id else {
            return;
        };
        self.helpers.emit(
            WorkerMessage {
                display: Some(DisplayMessage {
                    close: Some(id.clone()),
                    ..DisplayMessage::default()
                }),
                ..WorkerMessage::default()
            },
            false,
        );
    }

    fn send_typed(&self, content_type: &'static str, payload: Eventual<String>) {
        let display = self.clone_parts();
        self.helpers.resolve(payload, move |_, payload| {
            display.emit_mime(single(content_type, payload));
        });
    }

    fn clone_parts(&self) -> DisplayHandle {
        DisplayHandle {
            helpers: self.helpers.clone(),
            display_id: self.display_id.clone(),
        }
    }

    fn emit_mime(&self, bundle: MimeBundle) {
        self.helpers.emit(
            WorkerMessage {
                display: Some(DisplayMessage {
                    display_id: self.display_id.clone(),
                    mime: Some(bundle),
                    ..DisplayMessage::default()
                }),
                ..WorkerMessage::default()
            },
            false,
        );
    }
}
