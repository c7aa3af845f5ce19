//! Process-backed session checks. This test binary doubles as the worker: it
//! re-execs itself with the `worker` argv marker, so spawn, signal and
//! restart behavior run against a real child process.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use repl_session::{Session, SpawnConfig, TaskResult, worker};

use common::{Recorder, ScriptedEvaluator, TestValue};

fn worker_evaluator() -> ScriptedEvaluator {
    ScriptedEvaluator::new()
        .bind("greeting", TestValue::string("hello from the child"))
        .script("sleep", |_helpers| {
            std::thread::sleep(Duration::from_secs(30));
            Ok(repl_session::EvalOutcome::Value(common::value(
                TestValue::Undefined,
            )))
        })
}

fn main() {
    if worker::is_worker_mode() {
        worker::run(Box::new(worker_evaluator())).expect("worker loop");
        return;
    }
    #[cfg(target_family = "unix")]
    {
        execute_round_trip();
        restart_while_busy_kills_and_revives();
        kill_reports_the_exit_summary();
        println!("process_worker: ok");
    }
    #[cfg(not(target_family = "unix"))]
    println!("process_worker: skipped (unix-only worker spawning)");
}

#[cfg(target_family = "unix")]
fn spawn_session() -> Session {
    let config = SpawnConfig::current_exe().expect("current exe");
    Session::spawn(config).expect("spawn session")
}

#[cfg(target_family = "unix")]
fn execute_round_trip() {
    let session = spawn_session();
    let recorder = Recorder::new();
    session.execute("greeting", recorder.callbacks());
    recorder.wait_for_after_run();
    let Some(TaskResult::Mime(bundle)) = recorder.success() else {
        panic!("expected a mime result");
    };
    assert_eq!(
        common::text_plain(&bundle),
        Some("'hello from the child'")
    );
    session.shutdown();
}

#[cfg(target_family = "unix")]
fn restart_while_busy_kills_and_revives() {
    let session = spawn_session();

    // Occupy the worker so the kill lands mid-evaluation.
    let busy = Recorder::new();
    session.execute("sleep", busy.callbacks());
    std::thread::sleep(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    session.restart(
        Some("SIGKILL"),
        Some(Box::new(move |summary| {
            let _ = tx.send(summary);
        })),
    );
    let summary = rx
        .recv_timeout(Duration::from_secs(15))
        .expect("restart callback");
    assert_eq!(summary.signal, Some(libc::SIGKILL));

    // The reborn session serves fresh requests.
    let recorder = Recorder::new();
    session.execute("greeting", recorder.callbacks());
    recorder.wait_for_after_run();
    let Some(TaskResult::Mime(bundle)) = recorder.success() else {
        panic!("expected a mime result");
    };
    assert_eq!(
        common::text_plain(&bundle),
        Some("'hello from the child'")
    );
    session.shutdown();
}

#[cfg(target_family = "unix")]
fn kill_reports_the_exit_summary() {
    let session = spawn_session();

    // Park the worker in user code so it cannot exit cleanly on pipe EOF
    // before the signal arrives.
    let busy = Recorder::new();
    session.execute("sleep", busy.callbacks());
    std::thread::sleep(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    session.kill(
        Some("SIGKILL"),
        Some(Box::new(move |summary| {
            let _ = tx.send(summary);
        })),
    );
    let summary = rx
        .recv_timeout(Duration::from_secs(15))
        .expect("kill callback");
    assert_eq!(summary.signal, Some(libc::SIGKILL));
    assert_eq!(summary.code, None);
}
