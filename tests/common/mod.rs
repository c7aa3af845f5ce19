#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use repl_session::{
    ErrorReport, EvalOutcome, Evaluator, Helpers, MimeBundle, RequestMessage, Session,
    SessionConfig, TaskCallbacks, TaskResult, ThreadLauncher, Thrown, Value, ValueKind, ValueRef,
};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const WAIT: Duration = Duration::from_secs(10);

/// A miniature dynamically-typed value model with prototype chains, enough to
/// exercise inspection, enumeration and MIME encoding end to end.
#[derive(Clone)]
pub enum TestValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<TestValue>),
    Function { name: &'static str, arity: usize },
    Object {
        props: &'static [&'static str],
        proto: fn() -> ValueRef,
    },
    Global,
}

impl TestValue {
    pub fn string(value: impl Into<String>) -> Self {
        TestValue::Str(value.into())
    }
}

struct Proto {
    constructor: &'static str,
    props: &'static [&'static str],
    parent: Option<ValueRef>,
}

impl Value for Proto {
    fn kind(&self) -> ValueKind {
        ValueKind::Object
    }

    fn display(&self) -> String {
        "{}".to_string()
    }

    fn constructor_name(&self) -> Option<String> {
        Some(self.constructor.to_string())
    }

    fn prototype(&self) -> Option<ValueRef> {
        self.parent.clone()
    }

    fn own_property_names(&self) -> Vec<String> {
        self.props.iter().map(|p| p.to_string()).collect()
    }
}

pub fn object_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "Object",
                props: &[
                    "constructor",
                    "hasOwnProperty",
                    "isPrototypeOf",
                    "propertyIsEnumerable",
                    "toLocaleString",
                    "toString",
                    "valueOf",
                ],
                parent: None,
            })
        })
        .clone()
}

pub fn array_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "Array",
                props: &[
                    "concat", "filter", "forEach", "indexOf", "join", "length", "map", "pop",
                    "push", "reverse", "slice", "sort",
                ],
                parent: Some(object_proto()),
            })
        })
        .clone()
}

pub fn string_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "String",
                props: &["charAt", "indexOf", "length", "slice", "split", "substring", "trim"],
                parent: Some(object_proto()),
            })
        })
        .clone()
}

pub fn number_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "Number",
                props: &["toExponential", "toFixed", "toPrecision"],
                parent: Some(object_proto()),
            })
        })
        .clone()
}

pub fn boolean_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "Boolean",
                props: &[],
                parent: Some(object_proto()),
            })
        })
        .clone()
}

pub fn function_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "Function",
                props: &["apply", "bind", "call", "length", "name"],
                parent: Some(object_proto()),
            })
        })
        .clone()
}

pub fn error_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "Error",
                props: &["message", "name", "toString"],
                parent: Some(object_proto()),
            })
        })
        .clone()
}

pub fn range_error_proto() -> ValueRef {
    static PROTO: OnceLock<ValueRef> = OnceLock::new();
    PROTO
        .get_or_init(|| {
            Arc::new(Proto {
                constructor: "RangeError",
                props: &[],
                parent: Some(error_proto()),
            })
        })
        .clone()
}

const GLOBAL_NAMES: &[&str] = &[
    "Array",
    "Boolean",
    "Error",
    "Function",
    "JSON",
    "Math",
    "Number",
    "Object",
    "Promise",
    "String",
    "clearImmediate",
    "clearInterval",
    "clearTimeout",
    "console",
    "decodeURI",
    "encodeURI",
    "global",
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "process",
    "setImmediate",
    "setInterval",
    "setTimeout",
];

impl Value for TestValue {
    fn kind(&self) -> ValueKind {
        match self {
            TestValue::Undefined => ValueKind::Undefined,
            TestValue::Null => ValueKind::Null,
            TestValue::Bool(_) => ValueKind::Bool,
            TestValue::Number(_) => ValueKind::Number,
            TestValue::Str(_) => ValueKind::Str,
            TestValue::Function { .. } => ValueKind::Function,
            TestValue::Array(_) | TestValue::Object { .. } | TestValue::Global => ValueKind::Object,
        }
    }

    fn display(&self) -> String {
        match self {
            TestValue::Undefined => "undefined".to_string(),
            TestValue::Null => "null".to_string(),
            TestValue::Bool(value) => value.to_string(),
            TestValue::Number(value) => format_number(*value),
            TestValue::Str(value) => format!("'{value}'"),
            TestValue::Array(elements) => {
                if elements.is_empty() {
                    "[]".to_string()
                } else {
                    let rendered: Vec<String> =
                        elements.iter().map(|element| element.display()).collect();
                    format!("[ {} ]", rendered.join(", "))
                }
            }
            TestValue::Function { name, .. } => format!("[Function: {name}]"),
            TestValue::Object { .. } => "{}".to_string(),
            TestValue::Global => "[object global]".to_string(),
        }
    }

    fn length(&self) -> Option<usize> {
        match self {
            TestValue::Str(value) => Some(value.chars().count()),
            TestValue::Array(elements) => Some(elements.len()),
            TestValue::Function { arity, .. } => Some(*arity),
            _ => None,
        }
    }

    fn prototype(&self) -> Option<ValueRef> {
        match self {
            TestValue::Undefined | TestValue::Null => None,
            TestValue::Bool(_) => Some(boolean_proto()),
            TestValue::Number(_) => Some(number_proto()),
            TestValue::Str(_) => Some(string_proto()),
            TestValue::Array(_) => Some(array_proto()),
            TestValue::Function { .. } => Some(function_proto()),
            TestValue::Object { proto, .. } => Some(proto()),
            TestValue::Global => Some(object_proto()),
        }
    }

    fn own_property_names(&self) -> Vec<String> {
        match self {
            TestValue::Array(elements) => {
                let mut names: Vec<String> =
                    (0..elements.len()).map(|index| index.to_string()).collect();
                names.push("length".to_string());
                names
            }
            TestValue::Object { props, .. } => props.iter().map(|p| p.to_string()).collect(),
            TestValue::Global => GLOBAL_NAMES.iter().map(|n| n.to_string()).collect(),
            _ => Vec::new(),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

pub fn value(v: TestValue) -> ValueRef {
    Arc::new(v)
}

type Script = Box<dyn FnMut(&Helpers) -> Result<EvalOutcome, Thrown> + Send>;

/// Evaluator driven by canned bindings and scripts, keyed on the exact
/// source text. Unknown identifiers throw a reference error; the empty
/// string is the global scope object.
pub struct ScriptedEvaluator {
    bindings: HashMap<String, TestValue>,
    scripts: HashMap<String, Script>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            scripts: HashMap::new(),
        }
    }

    pub fn bind(mut self, code: impl Into<String>, value: TestValue) -> Self {
        self.bindings.insert(code.into(), value);
        self
    }

    pub fn script(
        mut self,
        code: impl Into<String>,
        script: impl FnMut(&Helpers) -> Result<EvalOutcome, Thrown> + Send + 'static,
    ) -> Self {
        self.scripts.insert(code.into(), Box::new(script));
        self
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&mut self, code: &str, helpers: &Helpers) -> Result<EvalOutcome, Thrown> {
        if let Some(script) = self.scripts.get_mut(code) {
            return script(helpers);
        }
        if code.is_empty() {
            return Ok(EvalOutcome::Value(value(TestValue::Global)));
        }
        if let Some(bound) = self.bindings.get(code) {
            return Ok(EvalOutcome::Value(value(bound.clone())));
        }
        Err(Thrown::new("ReferenceError", format!("{code} is not defined")).with_backtrace(vec![
            format!("ReferenceError: {code} is not defined"),
            "    at <anonymous>".to_string(),
        ]))
    }
}

/// Session backed by a worker thread; `factory` builds the evaluator for
/// every (re)spawn.
pub fn session_with(
    factory: impl Fn() -> ScriptedEvaluator + Send + Sync + 'static,
) -> Session {
    Session::new(SessionConfig::new(Arc::new(ThreadLauncher::new(
        move || Box::new(factory()),
    ))))
    .expect("session spawns")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BeforeRun,
    AfterRun,
    Success(TaskResult),
    Error(ErrorReport),
    Stdout(String),
    Stderr(String),
    Display(MimeBundle),
    Request(RequestMessage),
}

impl Event {
    pub fn label(&self) -> &'static str {
        match self {
            Event::BeforeRun => "before_run",
            Event::AfterRun => "after_run",
            Event::Success(_) => "on_success",
            Event::Error(_) => "on_error",
            Event::Stdout(_) => "on_stdout",
            Event::Stderr(_) => "on_stderr",
            Event::Display(_) => "on_display",
            Event::Request(_) => "on_request",
        }
    }
}

/// Records callback invocations in order and lets tests block until a
/// condition holds.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<(Mutex<Vec<Event>>, Condvar)>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }

    pub fn push(&self, event: Event) {
        let (events, cvar) = &*self.inner;
        events.lock().expect("recorder mutex poisoned").push(event);
        cvar.notify_all();
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.0.lock().expect("recorder mutex poisoned").clone()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::label).collect()
    }

    /// Blocks until `pred` holds over the recorded events; panics on timeout.
    pub fn wait_until(&self, pred: impl Fn(&[Event]) -> bool) -> Vec<Event> {
        let deadline = Instant::now() + WAIT;
        let (events, cvar) = &*self.inner;
        let mut guard = events.lock().expect("recorder mutex poisoned");
        loop {
            if pred(&guard) {
                return guard.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                panic!("timed out waiting for events; saw {:?}", *guard);
            }
            let (next, _timeout) = cvar
                .wait_timeout(guard, deadline.saturating_duration_since(now))
                .expect("recorder mutex poisoned");
            guard = next;
        }
    }

    pub fn wait_for_after_run(&self) -> Vec<Event> {
        self.wait_until(|events| events.iter().any(|e| matches!(e, Event::AfterRun)))
    }

    /// The standard callback set: every callback records an event.
    pub fn callbacks(&self) -> TaskCallbacks {
        let recorder = self.clone();
        let on_success = {
            let recorder = recorder.clone();
            move |result: &TaskResult| recorder.push(Event::Success(result.clone()))
        };
        let on_error = {
            let recorder = recorder.clone();
            move |report: &ErrorReport| recorder.push(Event::Error(report.clone()))
        };
        let before_run = {
            let recorder = recorder.clone();
            move || recorder.push(Event::BeforeRun)
        };
        let after_run = {
            let recorder = recorder.clone();
            move || recorder.push(Event::AfterRun)
        };
        let on_stdout = {
            let recorder = recorder.clone();
            move |chunk: &str| recorder.push(Event::Stdout(chunk.to_string()))
        };
        let on_stderr = {
            let recorder = recorder.clone();
            move |chunk: &str| recorder.push(Event::Stderr(chunk.to_string()))
        };
        let on_display = {
            let recorder = recorder.clone();
            move |bundle: &MimeBundle| recorder.push(Event::Display(bundle.clone()))
        };
        TaskCallbacks {
            on_success: Some(Arc::new(on_success)),
            on_error: Some(Arc::new(on_error)),
            before_run: Some(Arc::new(before_run)),
            after_run: Some(Arc::new(after_run)),
            on_stdout: Some(Arc::new(on_stdout)),
            on_stderr: Some(Arc::new(on_stderr)),
            on_display: Some(Arc::new(on_display)),
            on_request: None,
        }
    }

    pub fn success(&self) -> Option<TaskResult> {
        self.events().into_iter().find_map(|event| match event {
            Event::Success(result) => Some(result),
            _ => None,
        })
    }

    pub fn error(&self) -> Option<ErrorReport> {
        self.events().into_iter().find_map(|event| match event {
            Event::Error(report) => Some(report),
            _ => None,
        })
    }

    pub fn stdout(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Stdout(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }
}

pub fn text_plain(bundle: &MimeBundle) -> Option<&str> {
    bundle.get("text/plain").map(String::as_str)
}
