//! Per-request I/O capture inside the worker.
//!
//! While a frame is active for a context, bytes written through the worker's
//! stream handles are forwarded to the controller as `{id, stdout|stderr}`
//! messages and teed through to the real file descriptors. Frames nest, never
//! interleave: the worker runs one context at a time and an async context
//! keeps its frame until it ends.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::ipc::WorkerIpcConnection;
use crate::protocol::WorkerMessage;

static FRAMES: Mutex<Vec<FrameSinks>> = Mutex::new(Vec::new());
static TEE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Clone)]
struct FrameSinks {
    id: u64,
    conn: WorkerIpcConnection,
}

/// Installs the capture frame for a context. Released when the context sends
/// its terminal message (see `release`), not when this value drops.
pub(crate) fn install(id: u64, conn: WorkerIpcConnection) {
    let mut frames = FRAMES.lock().expect("capture frame mutex poisoned");
    frames.push(FrameSinks { id, conn });
}

/// Restores the originals for a context. Out-of-order release (an outer async
/// context ending after an inner one started) removes just that frame.
pub(crate) fn release(id: u64) {
    let mut frames = FRAMES.lock().expect("capture frame mutex poisoned");
    if let Some(index) = frames.iter().rposition(|frame| frame.id == id) {
        frames.remove(index);
    }
}

fn active_frame() -> Option<FrameSinks> {
    let frames = FRAMES.lock().expect("capture frame mutex poisoned");
    frames.last().cloned()
}

/// Writer handle for the worker's captured stdout.
pub struct WorkerStdout(());

/// Writer handle for the worker's captured stderr.
pub struct WorkerStderr(());

pub fn stdout() -> WorkerStdout {
    WorkerStdout(())
}

pub fn stderr() -> WorkerStderr {
    WorkerStderr(())
}

impl Write for WorkerStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_stream(StreamKind::Stdout, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for WorkerStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_stream(StreamKind::Stderr, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_stream(kind: StreamKind, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    match active_frame() {
        Some(frame) => forward(&frame, kind, bytes),
        None => tee_to_fd(kind, bytes),
    }
}

/// Sends a chunk on behalf of a specific context, regardless of which frame is
/// active. Console handles bound to an async context keep using its id after
/// newer frames come and go.
pub(crate) fn write_for_context(
    id: u64,
    conn: &WorkerIpcConnection,
    kind: StreamKind,
    bytes: &[u8],
) {
    if bytes.is_empty() {
        return;
    }
    let frame = FrameSinks {
        id,
        conn: conn.clone(),
    };
    forward(&frame, kind, bytes);
}

fn forward(frame: &FrameSinks, kind: StreamKind, bytes: &[u8]) {
    let chunk = String::from_utf8_lossy(bytes).into_owned();
    let message = match kind {
        StreamKind::Stdout => WorkerMessage::stdout(frame.id, chunk),
        StreamKind::Stderr => WorkerMessage::stderr(frame.id, chunk),
    };
    let _ = frame.conn.send(message);
    tee_to_fd(kind, bytes);
}

/// Passes a chunk through to the real descriptor. A single lock keeps
/// concurrent chunks contiguous; on a hard write error the rest of the
/// chunk is dropped (the forwarded message already carries the bytes).
fn tee_to_fd(kind: StreamKind, bytes: &[u8]) {
    let fd = match kind {
        StreamKind::Stdout => libc::STDOUT_FILENO,
        StreamKind::Stderr => libc::STDERR_FILENO,
    };
    let _guard = TEE_LOCK.lock().expect("tee lock poisoned");
    let mut rest = bytes;
    while !rest.is_empty() {
        let written = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if written < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        rest = &rest[written as usize..];
    }
}

/// Console-like logger bound to one context's streams. Survives the frame: an
/// async context's console keeps attributing output to that context.
#[derive(Clone)]
pub struct Console {
    id: u64,
    conn: WorkerIpcConnection,
}

impl Console {
    pub(crate) fn new(id: u64, conn: WorkerIpcConnection) -> Self {
        Self { id, conn }
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.line(StreamKind::Stdout, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.line(StreamKind::Stdout, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.line(StreamKind::Stderr, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.line(StreamKind::Stderr, message.as_ref());
    }

    fn line(&self, kind: StreamKind, message: &str) {
        let mut payload = Vec::with_capacity(message.len() + 1);
        payload.extend_from_slice(message.as_bytes());
        payload.push(b'\n');
        write_for_context(self.id, &self.conn, kind, &payload);
    }
}
