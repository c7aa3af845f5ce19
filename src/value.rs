use std::sync::Arc;
use std::sync::mpsc;

use crate::helpers::Helpers;
use crate::protocol::MimeBundle;

pub type ValueRef = Arc<dyn Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Undefined,
    Null,
    Bool,
    Number,
    Str,
    Function,
    Object,
}

impl ValueKind {
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ValueKind::Undefined
                | ValueKind::Null
                | ValueKind::Bool
                | ValueKind::Number
                | ValueKind::Str
        )
    }

    /// Wrapper constructor name for primitive kinds, e.g. `Boolean` for `Bool`.
    pub fn wrapper_name(self) -> Option<&'static str> {
        match self {
            ValueKind::Bool => Some("Boolean"),
            ValueKind::Number => Some("Number"),
            ValueKind::Str => Some("String"),
            _ => None,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::Undefined => "Undefined",
            ValueKind::Null => "Null",
            ValueKind::Bool => "Boolean",
            ValueKind::Number => "Number",
            ValueKind::Str => "String",
            ValueKind::Function => "Function",
            ValueKind::Object => "Object",
        }
    }
}

/// Runtime value surface the evaluator hands back to the worker.
///
/// The worker never constructs values; it only introspects them (inspection,
/// property enumeration) and serializes them (MIME encoding). Implementations
/// decide what a prototype chain and a canonical rendering mean for their
/// runtime.
pub trait Value: Send + Sync {
    fn kind(&self) -> ValueKind;

    /// Canonical inspect rendering: literal form for primitives, source-ish
    /// form for functions, debug form for objects.
    fn display(&self) -> String;

    /// The value-of (`toString`-like) form, when the value defines one.
    fn value_of(&self) -> Option<String> {
        None
    }

    fn length(&self) -> Option<usize> {
        None
    }

    /// Constructor name readable from this value when it sits on a prototype
    /// chain. `None` stops a constructor-list walk.
    fn constructor_name(&self) -> Option<String> {
        None
    }

    /// Next prototype in the chain. For primitives this is the wrapper
    /// prototype. Implementations should return clones of a shared allocation
    /// so chain walks can detect revisits by allocation identity.
    fn prototype(&self) -> Option<ValueRef> {
        None
    }

    fn own_property_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// User-defined MIME bundle seed (`_toMime`).
    fn to_mime(&self) -> Option<MimeBundle> {
        None
    }

    fn to_html(&self) -> Option<String> {
        None
    }

    fn to_svg(&self) -> Option<String> {
        None
    }

    fn to_png(&self) -> Option<Vec<u8>> {
        None
    }

    fn to_jpeg(&self) -> Option<Vec<u8>> {
        None
    }
}

/// An error thrown by evaluated code (or synthesized to look like one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thrown {
    pub name: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl Thrown {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Traceback lines for the wire; never empty.
    pub fn traceback(&self) -> Vec<String> {
        if self.backtrace.is_empty() {
            vec![format!("{}: {}", self.name, self.message)]
        } else {
            self.backtrace.clone()
        }
    }
}

impl std::fmt::Display for Thrown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Thrown {}

/// One-shot promise settled from another thread.
pub struct Deferred<T> {
    rx: mpsc::Receiver<Result<T, Thrown>>,
}

pub struct DeferredHandle<T> {
    tx: mpsc::Sender<Result<T, Thrown>>,
}

impl<T> Deferred<T> {
    pub fn pending() -> (DeferredHandle<T>, Deferred<T>) {
        let (tx, rx) = mpsc::channel();
        (DeferredHandle { tx }, Deferred { rx })
    }

    pub fn resolved(value: T) -> Self {
        let (handle, deferred) = Self::pending();
        handle.resolve(value);
        deferred
    }

    pub fn rejected(error: Thrown) -> Self {
        let (handle, deferred) = Self::pending();
        handle.reject(error);
        deferred
    }

    /// Blocks until settled. A dropped handle counts as a rejection.
    pub fn wait(self) -> Result<T, Thrown> {
        match self.rx.recv() {
            Ok(settled) => settled,
            Err(_) => Err(Thrown::new("Error", "deferred value was dropped unsettled")),
        }
    }
}

impl<T> DeferredHandle<T> {
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn reject(self, error: Thrown) {
        let _ = self.tx.send(Err(error));
    }
}

/// A value that is either ready now or arrives later through a deferred.
/// Helpers accept this wherever user data flows in.
pub enum Eventual<T> {
    Now(T),
    Later(Deferred<T>),
}

impl<T> From<T> for Eventual<T> {
    fn from(value: T) -> Self {
        Eventual::Now(value)
    }
}

impl<T> From<Deferred<T>> for Eventual<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Eventual::Later(deferred)
    }
}

impl From<&str> for Eventual<String> {
    fn from(value: &str) -> Self {
        Eventual::Now(value.to_string())
    }
}

/// Result of one evaluator invocation.
pub enum EvalOutcome {
    Value(ValueRef),
    Deferred(Deferred<ValueRef>),
}

impl From<ValueRef> for EvalOutcome {
    fn from(value: ValueRef) -> Self {
        EvalOutcome::Value(value)
    }
}

/// The language-evaluation primitive, injected by the embedder.
///
/// Contract:
/// - `evaluate` takes one source string and returns a value, a deferred value,
///   or a thrown error. It runs on the worker's request thread; helpers handed
///   in are cloneable and may outlive the call (timers, input continuations).
/// - Under the inspect and property-enumeration actions the worker evaluates
///   the matched expression text; the empty string denotes the global scope
///   object.
pub trait Evaluator: Send {
    fn evaluate(&mut self, code: &str, helpers: &Helpers) -> Result<EvalOutcome, Thrown>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_resolves_across_threads() {
        let (handle, deferred) = Deferred::pending();
        std::thread::spawn(move || handle.resolve(7usize));
        assert_eq!(deferred.wait().expect("resolved"), 7);
    }

    #[test]
    fn deferred_rejection_carries_thrown() {
        let deferred: Deferred<usize> = Deferred::rejected(Thrown::new("Error", "nope"));
        let err = deferred.wait().expect_err("rejected");
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn dropped_handle_rejects() {
        let (handle, deferred) = Deferred::<usize>::pending();
        drop(handle);
        let err = deferred.wait().expect_err("dropped");
        assert!(err.message.contains("unsettled"));
    }

    #[test]
    fn traceback_falls_back_to_headline() {
        let thrown = Thrown::new("TypeError", "x is not a function");
        assert_eq!(thrown.traceback(), vec!["TypeError: x is not a function"]);

        let with = thrown.with_backtrace(vec!["TypeError: x".into(), "  at y".into()]);
        assert_eq!(with.traceback().len(), 2);
    }
}
