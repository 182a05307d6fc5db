//! Integration tests for the ptrace tracer
//!
//! These trace real commands. Where ptrace is not permitted (seccomp
//! profiles, yama ptrace_scope=3) every test returns early.

use deptrace::exec::stream::{read_records_from_file, RecordWriter};
use deptrace::kernel::signal::CancelToken;
use deptrace::{DeptraceError, ExitStatus, ProcessTracer, TraceOutcome, TracerOptions, TrialCommand};
use std::time::{Duration, Instant};

fn command(argv: &[&str]) -> TrialCommand {
    let argv: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
    TrialCommand::from_argv(&argv).unwrap()
}

fn trace(argv: &[&str], follow_forks: bool) -> Option<TraceOutcome> {
    let tracer = ProcessTracer::new(TracerOptions { follow_forks });
    match tracer.trace(&command(argv)) {
        Ok(outcome) => Some(outcome),
        Err(DeptraceError::Tracer(e)) => {
            println!("ptrace unavailable, skipping: {}", e);
            None
        }
        Err(e) => panic!("unexpected trace failure: {:?}", e),
    }
}

fn records_for<'a>(outcome: &'a TraceOutcome, path: &str) -> Vec<&'a deptrace::FileAccessRecord> {
    outcome.records.iter().filter(|r| r.path == path).collect()
}

#[test]
fn test_records_follow_access_order() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.txt");
    std::fs::write(&present, b"hello\n").unwrap();
    let present = present.to_str().unwrap().to_string();
    let missing = dir.path().join("missing.txt").to_str().unwrap().to_string();

    let Some(outcome) = trace(&["/bin/cat", &present, &missing], false) else {
        return;
    };

    assert_eq!(outcome.exit, ExitStatus::Exited(1));
    let first_present = outcome.records.iter().position(|r| r.path == present).unwrap();
    let first_missing = outcome.records.iter().position(|r| r.path == missing).unwrap();
    assert!(first_present < first_missing);
    assert!(records_for(&outcome, &present).iter().all(|r| r.existed));
    assert!(records_for(&outcome, &missing).iter().all(|r| !r.existed));

    // execve of the target itself is observed
    assert!(outcome.records.iter().any(|r| r.path == "/bin/cat" && r.existed));
}

#[test]
fn test_exit_status_is_reported() {
    let Some(outcome) = trace(&["/bin/sh", "-c", "exit 3"], false) else {
        return;
    };
    assert_eq!(outcome.exit, ExitStatus::Exited(3));

    let Some(outcome) = trace(&["/bin/sh", "-c", "kill -9 $$"], false) else {
        return;
    };
    assert_eq!(outcome.exit, ExitStatus::Signaled(9));
}

#[test]
fn test_path_lengths_around_buffer_boundaries() {
    let word = std::mem::size_of::<libc::c_long>();
    let prefix = "/nonexistent-deptrace/";
    for total in [word - 1, word, word + 1, 4095, 4096, 4097, 9000] {
        let total = total.max(prefix.len() + 1);
        let path = format!("{}{}", prefix, "x".repeat(total - prefix.len()));
        assert_eq!(path.len(), total);

        let Some(outcome) = trace(&["/bin/cat", &path], false) else {
            return;
        };
        let seen = records_for(&outcome, &path);
        assert!(!seen.is_empty(), "path of length {} not observed intact", total);
        assert!(seen.iter().all(|r| !r.existed));
    }
}

#[test]
fn test_children_traced_when_following_forks() {
    let target = "/nonexistent-deptrace/child-target";
    let script = format!("/bin/cat {} 2>/dev/null; exit 0", target);

    let Some(outcome) = trace(&["/bin/sh", "-c", &script], true) else {
        return;
    };
    assert_eq!(outcome.exit, ExitStatus::Exited(0));
    assert!(!records_for(&outcome, target).is_empty());
}

#[test]
fn test_failed_exec_exits_127() {
    let Some(outcome) = trace(&["/nonexistent-deptrace/bin/tool"], false) else {
        return;
    };
    assert_eq!(outcome.exit, ExitStatus::Exited(127));
    assert!(outcome
        .records
        .iter()
        .any(|r| r.path == "/nonexistent-deptrace/bin/tool" && !r.existed));
}

#[test]
fn test_concurrent_fork_following_traces_keep_their_children() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let target = format!("/nonexistent-deptrace/concurrent-{}", i);
                let script = format!("/bin/cat {} 2>/dev/null; /bin/true; exit {}", target, 10 + i);
                (i, target, trace(&["/bin/sh", "-c", &script], true))
            })
        })
        .collect();

    for handle in handles {
        let (i, target, outcome) = handle.join().unwrap();
        let Some(outcome) = outcome else {
            return;
        };
        assert_eq!(outcome.exit, ExitStatus::Exited(10 + i));
        assert!(!records_for(&outcome, &target).is_empty());
        // nothing from the other traces leaked in
        assert!(outcome
            .records
            .iter()
            .filter(|r| r.path.starts_with("/nonexistent-deptrace/concurrent-"))
            .all(|r| r.path == target));
    }
}

#[test]
fn test_cancel_kills_traced_command() {
    let tracer = ProcessTracer::new(TracerOptions::default());
    let cancel = CancelToken::new().with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    match tracer.trace_cancellable(&command(&["/bin/sleep", "30"]), &cancel) {
        Err(DeptraceError::Cancelled) => {}
        Err(DeptraceError::Tracer(e)) => {
            println!("ptrace unavailable, skipping: {}", e);
            return;
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_streamed_records_match_collected() {
    let dir = tempfile::tempdir().unwrap();
    let stream = dir.path().join("trace.jsonl");
    let missing = "/nonexistent-deptrace/streamed";

    let tracer = ProcessTracer::new(TracerOptions::default());
    let mut writer = RecordWriter::create(&stream).unwrap();
    let exit = match tracer.trace_with_sink(
        &command(&["/bin/cat", missing]),
        &CancelToken::new(),
        &mut |record| writer.write(&record),
    ) {
        Ok(exit) => exit,
        Err(DeptraceError::Tracer(e)) => {
            println!("ptrace unavailable, skipping: {}", e);
            return;
        }
        Err(e) => panic!("unexpected trace failure: {:?}", e),
    };
    let written = writer.written();
    drop(writer);

    assert_eq!(exit, ExitStatus::Exited(1));
    let records = read_records_from_file(&stream).unwrap();
    assert_eq!(records.len(), written);
    assert!(records.iter().any(|r| r.path == missing && !r.existed));
}
