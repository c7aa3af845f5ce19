//! The OS-process primitive behind process-backed sessions: spawn the worker
//! executable with inherited IPC pipe fds, watch it for exit, deliver
//! signals.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::ipc::{IPC_READ_FD_ENV, IPC_WRITE_FD_ENV, IpcServer, IpcTransport};
use crate::session::{SessionError, WorkerLauncher, WorkerLink};
use crate::worker::WORKER_MODE_ARG;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-exec the current executable in worker mode, the usual arrangement
    /// for a host binary that checks `worker::is_worker_mode()` at startup.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![WORKER_MODE_ARG.to_string()],
            envs: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// How a worker process ended, in OS terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitSummary {
    #[cfg(target_family = "unix")]
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        ExitSummary {
            code: status.code(),
            signal: status.signal(),
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn from_status(status: std::process::ExitStatus) -> Self {
        ExitSummary {
            code: status.code(),
            signal: None,
        }
    }
}

pub type ExitCallback = Box<dyn FnOnce(ExitSummary) + Send>;

struct ExitState {
    summary: Option<ExitSummary>,
    handler: Option<ExitCallback>,
}

struct ProcessShared {
    child: Mutex<Child>,
    exit: Mutex<ExitState>,
    cvar: Condvar,
}

/// A spawned worker process plus its exit monitor.
pub struct WorkerProcess {
    pid: u32,
    shared: Arc<ProcessShared>,
}

impl WorkerProcess {
    /// Spawns the worker with a freshly bound IPC pipe pair and returns the
    /// controller-side transport. The child's pipe ends are closed in this
    /// process once the child owns them.
    pub fn spawn(config: &SpawnConfig) -> io::Result<(WorkerProcess, IpcTransport)> {
        let mut server = IpcServer::bind()?;

        #[cfg(target_family = "unix")]
        let child_fds = server
            .take_child_fds()
            .ok_or_else(|| io::Error::other("ipc child fds already taken"))?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (key, value) in &config.envs {
            command.env(key, value);
        }
        #[cfg(target_family = "unix")]
        {
            command
                .env(IPC_READ_FD_ENV, child_fds.read_fd.to_string())
                .env(IPC_WRITE_FD_ENV, child_fds.write_fd.to_string());
        }
        #[cfg(not(target_family = "unix"))]
        {
            let _ = (IPC_READ_FD_ENV, IPC_WRITE_FD_ENV);
        }

        let child = command.spawn()?;

        // The child inherited its pipe ends across exec; ours would keep the
        // pipes open past the child's lifetime.
        #[cfg(target_family = "unix")]
        unsafe {
            libc::close(child_fds.read_fd);
            libc::close(child_fds.write_fd);
        }

        let transport = server.into_transport()?;
        let pid = child.id();
        let shared = Arc::new(ProcessShared {
            child: Mutex::new(child),
            exit: Mutex::new(ExitState {
                summary: None,
                handler: None,
            }),
            cvar: Condvar::new(),
        });

        let monitor = shared.clone();
        thread::Builder::new()
            .name("repl-worker-monitor".to_string())
            .spawn(move || monitor_exit(monitor))?;

        crate::diagnostics::debug_log(format!("spawned worker pid {pid}"));
        Ok((WorkerProcess { pid, shared }, transport))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_summary(&self) -> Option<ExitSummary> {
        self.shared
            .exit
            .lock()
            .expect("exit state mutex poisoned")
            .summary
    }

    /// Registers the single exit handler, replacing any previous one. Runs
    /// immediately when the process has already exited.
    pub fn set_exit_handler(&self, handler: ExitCallback) {
        let already = {
            let mut exit = self.shared.exit.lock().expect("exit state mutex poisoned");
            match exit.summary {
                Some(summary) => Some(summary),
                None => {
                    exit.handler = Some(handler);
                    return;
                }
            }
        };
        if let Some(summary) = already {
            handler(summary);
        }
    }

    /// Delivers a signal to the worker.
    pub fn kill(&self, signal: i32) -> io::Result<()> {
        #[cfg(target_family = "unix")]
        {
            let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                // Already reaped by the monitor.
                if err.raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }
                return Err(err);
            }
            Ok(())
        }
        #[cfg(not(target_family = "unix"))]
        {
            let _ = signal;
            let mut child = self.shared.child.lock().expect("child mutex poisoned");
            child.kill()
        }
    }

    /// Blocks until the monitor observes the exit, up to `timeout`.
    pub fn wait_exit(&self, timeout: Duration) -> Option<ExitSummary> {
        let deadline = std::time::Instant::now() + timeout;
        let mut exit = self.shared.exit.lock().expect("exit state mutex poisoned");
        loop {
            if let Some(summary) = exit.summary {
                return Some(summary);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(now);
            let (next, timeout_res) = self
                .shared
                .cvar
                .wait_timeout(exit, remaining)
                .expect("exit state mutex poisoned");
            exit = next;
            if timeout_res.timed_out() {
                return exit.summary;
            }
        }
    }
}

fn monitor_exit(shared: Arc<ProcessShared>) {
    let summary = loop {
        let status = {
            let mut child = shared.child.lock().expect("child mutex poisoned");
            child.try_wait()
        };
        match status {
            Ok(Some(status)) => break ExitSummary::from_status(status),
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(err) => {
                crate::diagnostics::debug_log(format!("worker exit poll failed: {err}"));
                break ExitSummary::default();
            }
        }
    };

    let handler = {
        let mut exit = shared.exit.lock().expect("exit state mutex poisoned");
        exit.summary = Some(summary);
        shared.cvar.notify_all();
        exit.handler.take()
    };
    if let Some(handler) = handler {
        handler(summary);
    }
}

/// Symbolic signal name to number. `None` input means `SIGTERM`.
pub(crate) fn signal_number(name: Option<&str>) -> i32 {
    #[cfg(target_family = "unix")]
    {
        match name {
            None | Some("SIGTERM") => libc::SIGTERM,
            Some("SIGKILL") => libc::SIGKILL,
            Some("SIGINT") => libc::SIGINT,
            Some("SIGHUP") => libc::SIGHUP,
            Some("SIGQUIT") => libc::SIGQUIT,
            Some("SIGUSR1") => libc::SIGUSR1,
            Some("SIGUSR2") => libc::SIGUSR2,
            Some(other) => {
                crate::diagnostics::debug_log(format!("unknown signal {other}; using SIGTERM"));
                libc::SIGTERM
            }
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        let _ = name;
        0
    }
}

/// Launches worker processes from a fixed spawn configuration.
pub struct ProcessLauncher {
    config: SpawnConfig,
}

impl ProcessLauncher {
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> Result<WorkerLink, SessionError> {
        let (process, transport) = WorkerProcess::spawn(&self.config)?;
        Ok(WorkerLink {
            transport,
            process: Some(process),
        })
    }
}
