//! Long-lived code-evaluation sessions for a dynamic scripting runtime.
//!
//! A [`Session`] owns a spawned evaluator worker and multiplexes
//! callback-driven requests (execute / complete / inspect) onto it over a
//! strictly-ordered queue. Inside the worker, each request runs under an I/O
//! capture frame with a user-facing [`Helpers`] namespace for asynchronous
//! completion, MIME emission, display updates and client prompts. The
//! language-evaluation primitive itself is injected through the
//! [`Evaluator`] trait.

pub mod capture;
pub mod diagnostics;
pub mod doc;
pub mod expr;
pub mod helpers;
pub mod inspect;
pub mod ipc;
pub mod mime;
pub mod protocol;
pub mod session;
pub mod spawn;
pub mod value;
pub mod worker;

pub use crate::helpers::{DisplayHandle, Helpers};
pub use crate::protocol::{
    Action, ClearOptions, CompletionReply, ErrorReport, InputOptions, InspectionReply,
    InspectionReport, MimeBundle, RequestMessage,
};
pub use crate::session::{
    CodeTransform, LogSink, ReplyHandle, Session, SessionConfig, SessionError, TaskCallbacks,
    TaskResult, Transformed, WorkerLauncher, WorkerLink,
};
pub use crate::spawn::{ExitSummary, ProcessLauncher, SpawnConfig};
pub use crate::value::{
    Deferred, DeferredHandle, EvalOutcome, Evaluator, Eventual, Thrown, Value, ValueKind, ValueRef,
};
pub use crate::worker::ThreadLauncher;
