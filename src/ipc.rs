use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
#[cfg(target_family = "unix")]
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::protocol::{ControllerFrame, WorkerMessage};

pub const IPC_READ_FD_ENV: &str = "REPL_SESSION_IPC_READ_FD";
pub const IPC_WRITE_FD_ENV: &str = "REPL_SESSION_IPC_WRITE_FD";

#[derive(Debug)]
pub enum IpcError {
    /// The peer end of the channel is gone; the frame was not delivered.
    Closed,
    Io(io::Error),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::Closed => write!(f, "ipc channel closed"),
            IpcError::Io(err) => write!(f, "ipc io error: {err}"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        IpcError::Io(err)
    }
}

/// Byte-level duplex the framed connections run over.
pub struct IpcTransport {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl IpcTransport {
    /// Builds an in-process duplex: two pipes crossed over. The first
    /// transport is the controller end, the second the worker end.
    pub fn pair() -> io::Result<(IpcTransport, IpcTransport)> {
        let (controller_read, worker_write) = io::pipe()?;
        let (worker_read, controller_write) = io::pipe()?;
        Ok((
            IpcTransport {
                reader: Box::new(controller_read),
                writer: Box::new(controller_write),
            },
            IpcTransport {
                reader: Box::new(worker_read),
                writer: Box::new(worker_write),
            },
        ))
    }
}

/// Ordered stream of worker messages, as seen by the controller's router.
pub enum RouterEvent {
    Message(WorkerMessage),
    /// The read end hit EOF or an error; no further messages will arrive.
    Disconnected,
}

pub type Router = Arc<dyn Fn(RouterEvent) + Send + Sync>;

/// Controller end of the channel. Inbound messages are parsed on a reader
/// thread and handed to the router in arrival order; outbound frames drain
/// through a writer thread.
#[derive(Clone)]
pub struct ControllerIpcConnection {
    sender: mpsc::Sender<ControllerFrame>,
}

impl ControllerIpcConnection {
    pub fn new(transport: IpcTransport, router: Router) -> Self {
        let (tx, rx) = mpsc::channel();
        let IpcTransport { reader, writer } = transport;
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        router(RouterEvent::Disconnected);
                        break;
                    }
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerMessage>(trimmed) {
                    Ok(message) => router(RouterEvent::Message(message)),
                    Err(err) => {
                        crate::diagnostics::debug_log(format!("dropping unparsable message: {err}"));
                    }
                }
            }
        });

        spawn_writer(rx, writer);

        Self { sender: tx }
    }

    pub fn send(&self, frame: ControllerFrame) -> Result<(), IpcError> {
        self.sender.send(frame).map_err(|_| IpcError::Closed)
    }
}

#[derive(Default)]
struct WorkerInbox {
    queue: VecDeque<ControllerFrame>,
    disconnected: bool,
}

/// Worker end of the channel: blocking `recv` over a condvar-guarded inbox.
#[derive(Clone)]
pub struct WorkerIpcConnection {
    sender: mpsc::Sender<WorkerMessage>,
    inbox: Arc<Mutex<WorkerInbox>>,
    cvar: Arc<Condvar>,
}

impl WorkerIpcConnection {
    pub fn new(transport: IpcTransport) -> Self {
        let (tx, rx) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(WorkerInbox::default()));
        let cvar = Arc::new(Condvar::new());

        let reader_inbox = inbox.clone();
        let reader_cvar = cvar.clone();
        let IpcTransport { reader, writer } = transport;
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        let mut guard = reader_inbox.lock().expect("worker inbox mutex poisoned");
                        guard.disconnected = true;
                        reader_cvar.notify_all();
                        break;
                    }
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(frame) = serde_json::from_str::<ControllerFrame>(trimmed) {
                    let mut guard = reader_inbox.lock().expect("worker inbox mutex poisoned");
                    guard.queue.push_back(frame);
                    reader_cvar.notify_all();
                }
            }
        });

        spawn_writer(rx, writer);

        Self {
            sender: tx,
            inbox,
            cvar,
        }
    }

    pub fn send(&self, message: WorkerMessage) -> Result<(), IpcError> {
        self.sender.send(message).map_err(|_| IpcError::Closed)
    }

    /// Next inbound frame; `None` on disconnect or timeout.
    pub fn recv(&self, timeout: Option<Duration>) -> Option<ControllerFrame> {
        let mut guard = self.inbox.lock().expect("worker inbox mutex poisoned");
        if let Some(frame) = guard.queue.pop_front() {
            return Some(frame);
        }
        if guard.disconnected {
            return None;
        }

        match timeout {
            None => loop {
                guard = self.cvar.wait(guard).expect("worker inbox mutex poisoned");
                if let Some(frame) = guard.queue.pop_front() {
                    return Some(frame);
                }
                if guard.disconnected {
                    return None;
                }
            },
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                loop {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let remaining = deadline.saturating_duration_since(now);
                    let (next_guard, timeout_res) = self
                        .cvar
                        .wait_timeout(guard, remaining)
                        .expect("worker inbox mutex poisoned");
                    guard = next_guard;
                    if let Some(frame) = guard.queue.pop_front() {
                        return Some(frame);
                    }
                    if guard.disconnected {
                        return None;
                    }
                    if timeout_res.timed_out() {
                        return None;
                    }
                }
            }
        }
    }
}

fn spawn_writer<T>(rx: mpsc::Receiver<T>, mut writer: Box<dyn Write + Send>)
where
    T: Serialize + Send + 'static,
{
    thread::spawn(move || {
        for message in rx {
            if let Ok(payload) = serde_json::to_string(&message) {
                if writer.write_all(payload.as_bytes()).is_err() {
                    break;
                }
                if writer.write_all(b"\n").is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }
    });
}

/// Controller-side pipe pair whose child ends are inherited by the spawned
/// worker process.
pub struct IpcServer {
    #[cfg(target_family = "unix")]
    server_read: Option<std::io::PipeReader>,
    #[cfg(target_family = "unix")]
    server_write: Option<std::io::PipeWriter>,
    #[cfg(target_family = "unix")]
    child_fds: Option<IpcChildFds>,
}

#[cfg(target_family = "unix")]
pub(crate) struct IpcChildFds {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
}

impl IpcServer {
    pub fn bind() -> io::Result<Self> {
        #[cfg(target_family = "unix")]
        {
            let (server_read, server_write, child_read, child_write) = create_pipe_pair()?;
            Ok(Self {
                server_read: Some(server_read),
                server_write: Some(server_write),
                child_fds: Some(IpcChildFds {
                    read_fd: child_read,
                    write_fd: child_write,
                }),
            })
        }
        #[cfg(not(target_family = "unix"))]
        {
            // Worker spawning relies on Unix-style pipe handle inheritance;
            // in-process sessions remain available everywhere.
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "worker IPC requires Unix-style pipe handle inheritance",
            ))
        }
    }

    #[cfg(target_family = "unix")]
    pub(crate) fn take_child_fds(&mut self) -> Option<IpcChildFds> {
        self.child_fds.take()
    }

    /// The controller's end of the channel, once the child owns its fds.
    pub fn into_transport(self) -> io::Result<IpcTransport> {
        #[cfg(target_family = "unix")]
        {
            let Some(server_read) = self.server_read else {
                return Err(io::Error::other("missing ipc read pipe"));
            };
            let Some(server_write) = self.server_write else {
                return Err(io::Error::other("missing ipc write pipe"));
            };
            Ok(IpcTransport {
                reader: Box::new(server_read),
                writer: Box::new(server_write),
            })
        }
        #[cfg(not(target_family = "unix"))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "worker IPC requires Unix-style pipe handle inheritance",
            ))
        }
    }
}

#[cfg(target_family = "unix")]
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_family = "unix")]
fn create_pipe_pair() -> io::Result<(std::io::PipeReader, std::io::PipeWriter, RawFd, RawFd)> {
    let (server_read, child_write) = std::io::pipe()?;
    let (child_read, server_write) = std::io::pipe()?;

    let child_read_fd = child_read.into_raw_fd();
    let child_write_fd = child_write.into_raw_fd();

    set_cloexec(child_read_fd, false)?;
    set_cloexec(child_write_fd, false)?;
    set_cloexec(server_read.as_raw_fd(), true)?;
    set_cloexec(server_write.as_raw_fd(), true)?;

    Ok((server_read, server_write, child_read_fd, child_write_fd))
}

/// Worker-process side: adopts the fds named by the environment.
pub fn connect_from_env() -> io::Result<IpcTransport> {
    #[cfg(target_family = "unix")]
    {
        let read_fd = std::env::var(IPC_READ_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "IPC read fd missing"))?;
        let write_fd = std::env::var(IPC_WRITE_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "IPC write fd missing"))?;
        let read_fd: RawFd = read_fd
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPC read fd"))?;
        let write_fd: RawFd = write_fd
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPC write fd"))?;
        set_cloexec(read_fd, true)?;
        set_cloexec(write_fd, true)?;
        let reader = unsafe { File::from_raw_fd(read_fd) };
        let writer = unsafe { File::from_raw_fd(write_fd) };
        Ok(IpcTransport {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
    #[cfg(not(target_family = "unix"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "worker IPC requires Unix-style pipe handle inheritance",
        ))
    }
}
