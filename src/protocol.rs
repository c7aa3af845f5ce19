use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Mapping from content-type string to payload string. Binary payloads
/// (`image/png`, `image/jpeg`) are base64 strings.
pub type MimeBundle = BTreeMap<String, String>;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const IMAGE_SVG: &str = "image/svg+xml";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const APPLICATION_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Inspect,
    GetAllPropertyNames,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Inspect => "inspect",
            Action::GetAllPropertyNames => "getAllPropertyNames",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(Action::Run),
            "inspect" => Some(Action::Inspect),
            "getAllPropertyNames" => Some(Action::GetAllPropertyNames),
            _ => None,
        }
    }
}

const REPLY_TAG: &str = "reply";

/// Controller→worker frame. Positional on the wire:
/// `[action, code, contextId]` or `["reply", payload, contextId, requestId]`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerFrame {
    Request {
        action: Action,
        code: String,
        id: u64,
    },
    Reply {
        payload: serde_json::Value,
        id: u64,
        request_id: u64,
    },
    /// Unrecognized action tag. Kept so the worker can answer with a protocol
    /// error carrying the right context id.
    Unknown {
        action: String,
        id: Option<u64>,
    },
}

impl Serialize for ControllerFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ControllerFrame::Request { action, code, id } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(action.as_str())?;
                seq.serialize_element(code)?;
                seq.serialize_element(id)?;
                seq.end()
            }
            ControllerFrame::Reply {
                payload,
                id,
                request_id,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(REPLY_TAG)?;
                seq.serialize_element(payload)?;
                seq.serialize_element(id)?;
                seq.serialize_element(request_id)?;
                seq.end()
            }
            ControllerFrame::Unknown { action, id } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(action)?;
                seq.serialize_element("")?;
                seq.serialize_element(&id.unwrap_or(0))?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ControllerFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let elements = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let tag = elements
            .first()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| D::Error::custom("frame is missing its action tag"))?
            .to_string();

        if tag == REPLY_TAG {
            let payload = elements
                .get(1)
                .cloned()
                .ok_or_else(|| D::Error::custom("reply frame is missing its payload"))?;
            let id = frame_id(&elements, 2)
                .ok_or_else(|| D::Error::custom("reply frame is missing its context id"))?;
            let request_id = frame_id(&elements, 3)
                .ok_or_else(|| D::Error::custom("reply frame is missing its request id"))?;
            return Ok(ControllerFrame::Reply {
                payload,
                id,
                request_id,
            });
        }

        let id = frame_id(&elements, 2);
        match Action::parse(&tag) {
            Some(action) => {
                let code = elements
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| D::Error::custom("request frame is missing its code"))?
                    .to_string();
                let id =
                    id.ok_or_else(|| D::Error::custom("request frame is missing its context id"))?;
                Ok(ControllerFrame::Request { action, code, id })
            }
            None => Ok(ControllerFrame::Unknown { action: tag, id }),
        }
    }
}

fn frame_id(elements: &[serde_json::Value], index: usize) -> Option<u64> {
    elements.get(index).and_then(serde_json::Value::as_u64)
}

/// Worker→controller message. A self-describing record: exactly one payload
/// field is set per message, `id` when it pertains to a context, `end` on the
/// terminal message of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<MimeBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspection: Option<InspectionReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

pub const STATUS_ONLINE: &str = "online";

impl WorkerMessage {
    pub fn status_online() -> Self {
        WorkerMessage {
            status: Some(STATUS_ONLINE.to_string()),
            ..WorkerMessage::default()
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        WorkerMessage {
            log: Some(message.into()),
            ..WorkerMessage::default()
        }
    }

    pub fn stdout(id: u64, chunk: impl Into<String>) -> Self {
        WorkerMessage {
            id: Some(id),
            stdout: Some(chunk.into()),
            ..WorkerMessage::default()
        }
    }

    pub fn stderr(id: u64, chunk: impl Into<String>) -> Self {
        WorkerMessage {
            id: Some(id),
            stderr: Some(chunk.into()),
            ..WorkerMessage::default()
        }
    }

    pub fn error(id: u64, report: ErrorReport, end: bool) -> Self {
        WorkerMessage {
            id: Some(id),
            end,
            error: Some(report),
            ..WorkerMessage::default()
        }
    }

    pub fn mime(id: u64, bundle: MimeBundle, end: bool) -> Self {
        WorkerMessage {
            id: Some(id),
            end,
            mime: Some(bundle),
            ..WorkerMessage::default()
        }
    }
}

/// Incremental display update. Exactly one of `open`, `mime`, `close` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<MimeBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<String>,
}

/// A sub-request issued by user code back to the client. `input` expects a
/// `reply` frame; `clear` expects none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear: Option<ClearOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputOptions {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearOptions {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

impl ErrorReport {
    pub fn from_thrown(thrown: &crate::value::Thrown) -> Self {
        ErrorReport {
            ename: thrown.name.clone(),
            evalue: thrown.message.clone(),
            traceback: thrown.traceback(),
        }
    }
}

/// Structured inspection of a single value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionReport {
    pub string: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(
        rename = "constructorList",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub constructor_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

/// Completion result delivered through `on_success`. Synthesized by the
/// controller; present on the wire only for symmetry with the other results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionReply {
    pub list: Vec<String>,
    pub code: String,
    #[serde(rename = "cursorPos")]
    pub cursor_pos: usize,
    #[serde(rename = "matchedText")]
    pub matched_text: String,
    #[serde(rename = "cursorStart")]
    pub cursor_start: usize,
    #[serde(rename = "cursorEnd")]
    pub cursor_end: usize,
}

/// Inspection result delivered through `on_success`: the worker's report plus
/// the originating request coordinates and the resolved documentation record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionReply {
    #[serde(flatten)]
    pub report: InspectionReport,
    pub code: String,
    #[serde(rename = "cursorPos")]
    pub cursor_pos: usize,
    #[serde(rename = "matchedText")]
    pub matched_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<crate::doc::DocRecord>,
}
