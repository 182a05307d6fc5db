//! Resolution scenarios against a scripted in-memory sandbox

use deptrace::kernel::signal::CancelToken;
use deptrace::observability::journal::Journal;
use deptrace::resolve::{CandidateSet, EngineOptions, Resolution, ResolutionEngine};
use deptrace::sandbox::{SandboxProvider, SnapshotHandle, TraceSource, TrialRun};
use deptrace::{ContentsIndex, DeptraceError, ExitStatus, FileAccessRecord, IndexKey, Result, TrialCommand};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type Behavior = dyn Fn(&TrialCommand, &[String]) -> (ExitStatus, Vec<FileAccessRecord>) + Send + Sync;

/// Sandbox whose trials answer from a closure over the installed packages
struct ScriptedSandbox {
    behavior: Box<Behavior>,
    next_id: AtomicUsize,
    live: Mutex<HashMap<String, Vec<String>>>,
    installs: Mutex<Vec<Vec<String>>>,
    broken: Vec<String>,
    out_of_space: Vec<String>,
    slow: Vec<String>,
}

impl ScriptedSandbox {
    fn new<F>(behavior: F) -> Self
    where
        F: Fn(&TrialCommand, &[String]) -> (ExitStatus, Vec<FileAccessRecord>) + Send + Sync + 'static,
    {
        Self {
            behavior: Box::new(behavior),
            next_id: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
            installs: Mutex::new(Vec::new()),
            broken: Vec::new(),
            out_of_space: Vec::new(),
            slow: Vec::new(),
        }
    }

    /// Package sets (sorted) in the order they were installed
    fn installs(&self) -> Vec<Vec<String>> {
        self.installs.lock().unwrap().clone()
    }

    fn live_snapshots(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn packages_of(&self, snapshot: &SnapshotHandle) -> Result<Vec<String>> {
        self.live
            .lock()
            .unwrap()
            .get(&snapshot.id)
            .cloned()
            .ok_or_else(|| DeptraceError::Sandbox(format!("snapshot {} is gone", snapshot.id)))
    }
}

impl SandboxProvider for ScriptedSandbox {
    fn new_snapshot(&self, base: Option<&SnapshotHandle>) -> Result<SnapshotHandle> {
        let packages = match base {
            Some(base) => self.packages_of(base)?,
            None => Vec::new(),
        };
        let id = format!("snap-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().insert(id.clone(), packages.clone());
        Ok(SnapshotHandle::new(id, packages))
    }

    fn install(&self, snapshot: &SnapshotHandle, package: &str) -> Result<SnapshotHandle> {
        if self.out_of_space.iter().any(|p| p == package) {
            return Err(DeptraceError::Backend("no space left on device".to_string()));
        }
        if self.broken.iter().any(|p| p == package) {
            return Err(DeptraceError::Sandbox(format!("unable to install {}", package)));
        }
        let mut live = self.live.lock().unwrap();
        let packages = live
            .get_mut(&snapshot.id)
            .ok_or_else(|| DeptraceError::Sandbox(format!("snapshot {} is gone", snapshot.id)))?;
        packages.push(package.to_string());

        let mut installed = packages.clone();
        installed.sort();
        self.installs.lock().unwrap().push(installed);
        Ok(SnapshotHandle::new(snapshot.id.clone(), packages.clone()))
    }

    fn run(
        &self,
        snapshot: &SnapshotHandle,
        command: &TrialCommand,
        _cwd_mirror: &Path,
        cancel: &CancelToken,
    ) -> Result<TrialRun> {
        let packages = self.packages_of(snapshot)?;
        if packages.iter().any(|p| self.slow.contains(p)) {
            let started = Instant::now();
            while started.elapsed() < Duration::from_secs(5) {
                if cancel.is_cancelled() {
                    return Err(DeptraceError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        let (exit, records) = (self.behavior)(command, &packages);
        Ok(TrialRun {
            exit,
            trace: TraceSource::Records(records),
        })
    }

    fn discard(&self, snapshot: SnapshotHandle) {
        self.live.lock().unwrap().remove(&snapshot.id);
    }
}

fn index(entries: &[(&str, &[&str])]) -> ContentsIndex {
    let mut index = ContentsIndex::new(IndexKey::new("apt", "ubuntu", "noble", "amd64"));
    for (path, packages) in entries {
        let packages: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
        index.insert(path, &packages);
    }
    index
}

fn has(packages: &[String], name: &str) -> bool {
    packages.iter().any(|p| p == name)
}

fn cmd(program: &str) -> TrialCommand {
    TrialCommand::new(program, &[])
}

fn set(packages: &[&str]) -> CandidateSet {
    CandidateSet::from_packages(packages.iter().copied())
}

fn options(parallelism: usize) -> EngineOptions {
    EngineOptions {
        parallelism,
        ..Default::default()
    }
}

/// `/usr/bin/tool` provided by `a` and `b`; either one makes the command work
fn tool_sandbox() -> ScriptedSandbox {
    ScriptedSandbox::new(|_, packages| {
        if has(packages, "a") || has(packages, "b") {
            (ExitStatus::Exited(0), vec![FileAccessRecord::present("/usr/bin/tool")])
        } else {
            (ExitStatus::Exited(127), vec![FileAccessRecord::missing("/usr/bin/tool")])
        }
    })
}

#[test]
fn test_exit_ok_command_resolves_to_foo_libs() {
    let sandbox = ScriptedSandbox::new(|_, packages| {
        let record = if has(packages, "foo-libs") {
            FileAccessRecord::present("/opt/lib/libfoo.so")
        } else {
            FileAccessRecord::missing("/opt/lib/libfoo.so")
        };
        (ExitStatus::Exited(0), vec![record])
    });
    let index = index(&[("opt/lib/libfoo.so", &["foo-libs"])]);
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::create(&dir.path().join("journal.jsonl"), "foo-check").unwrap();

    let engine = ResolutionEngine::new(&sandbox, &index, options(1)).with_journal(&journal);
    let resolution = engine.resolve(&cmd("foo-check"), 1).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["foo-libs"])]));
    assert_eq!(sandbox.installs(), vec![vec!["foo-libs".to_string()]]);
    assert_eq!(sandbox.live_snapshots(), 0);

    let events: Vec<serde_json::Value> = std::fs::read_to_string(journal.path())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let finished: Vec<&serde_json::Value> = events
        .iter()
        .filter(|e| e["event"] == "trial_finished")
        .collect();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[0]["missing"], 1);
    assert_eq!(finished[0]["state"], "improved");
    assert_eq!(finished[1]["missing"], 0);
    assert_eq!(finished[1]["state"], "succeeded");
}

#[test]
fn test_alternative_providers_in_index_order() {
    let sandbox = tool_sandbox();
    let index = index(&[("usr/bin/tool", &["a", "b"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("tool"), 2).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["a"]), set(&["b"])]));
}

#[test]
fn test_max_solutions_stops_early() {
    let sandbox = tool_sandbox();
    let index = index(&[("usr/bin/tool", &["a", "b"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("tool"), 1).unwrap();

    assert_eq!(resolution.solutions(), &[set(&["a"])]);
    // `b` was never materialized
    assert_eq!(sandbox.installs(), vec![vec!["a".to_string()]]);
}

#[test]
fn test_unprovided_path_is_reported_unresolved() {
    let sandbox = ScriptedSandbox::new(|_, _| {
        (
            ExitStatus::Exited(1),
            vec![
                FileAccessRecord::present("/etc/ld.so.cache"),
                FileAccessRecord::missing("/opt/vendor/libsecret.so"),
            ],
        )
    });
    let index = index(&[]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("vendor-tool"), 1).unwrap();

    let Resolution::Exhausted(partial) = resolution else {
        panic!("expected exhaustion, got {:?}", resolution);
    };
    assert!(partial.best_partial.is_empty());
    assert_eq!(partial.unresolved_paths, vec!["/opt/vendor/libsecret.so".to_string()]);
    assert_eq!(partial.exit, Some(ExitStatus::Exited(1)));
    assert!(!partial.interrupted);
    assert_eq!(sandbox.live_snapshots(), 0);
}

#[test]
fn test_candidate_sets_are_never_materialized_twice() {
    // x and y are both needed, /opt/z has no provider at all
    let sandbox = ScriptedSandbox::new(|_, packages| {
        let mut records = Vec::new();
        for (path, package) in [("/usr/lib/libx.so", "x"), ("/usr/lib/liby.so", "y")] {
            records.push(FileAccessRecord::new(path, has(packages, package)));
        }
        records.push(FileAccessRecord::missing("/opt/z"));
        (ExitStatus::Exited(1), records)
    });
    let index = index(&[("usr/lib/libx.so", &["x"]), ("usr/lib/liby.so", &["y"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("static"), 0).unwrap();

    let installs = sandbox.installs();
    let mut distinct = installs.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(installs.len(), distinct.len(), "repeated installs: {:?}", installs);
    assert!(engine.stats().skipped_tried >= 1);

    let Resolution::Exhausted(partial) = resolution else {
        panic!("expected exhaustion");
    };
    assert_eq!(partial.best_partial, set(&["x", "y"]));
    assert_eq!(partial.unresolved_paths, vec!["/opt/z".to_string()]);
}

#[test]
fn test_tried_set_is_judged_again_under_another_parent() {
    // {a, b} changes nothing over [a] but does over [b], and only its
    // extension by c works
    let sandbox = ScriptedSandbox::new(|_, packages| {
        let (a, b, c) = (has(packages, "a"), has(packages, "b"), has(packages, "c"));
        if a && b && c {
            (ExitStatus::Exited(0), vec![FileAccessRecord::present("/usr/bin/x")])
        } else if a && !c {
            (
                ExitStatus::Exited(2),
                vec![
                    FileAccessRecord::missing("/usr/bin/x"),
                    FileAccessRecord::missing("/usr/lib/liby.so"),
                ],
            )
        } else if b && !a {
            (ExitStatus::Exited(3), vec![FileAccessRecord::missing("/usr/share/w.dat")])
        } else if packages.is_empty() {
            (ExitStatus::Exited(1), vec![FileAccessRecord::missing("/usr/bin/x")])
        } else {
            (ExitStatus::Exited(1), vec![FileAccessRecord::missing("/opt/z")])
        }
    });
    let index = index(&[
        ("usr/bin/x", &["a", "b"]),
        ("usr/lib/liby.so", &["c"]),
        ("usr/share/w.dat", &["a"]),
    ]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("xyz"), 0).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["b", "a", "c"])]));
    assert_eq!(engine.stats().reused, 1);

    // {a, b} was installed once and its snapshot carried over
    let installs = sandbox.installs();
    let ab = vec!["a".to_string(), "b".to_string()];
    assert_eq!(installs.iter().filter(|i| **i == ab).count(), 1);
    assert_eq!(installs.len(), 5);
    assert_eq!(sandbox.live_snapshots(), 0);
}

#[test]
fn test_solution_path_grows_monotonically() {
    // a's binary in turn needs b
    let sandbox = ScriptedSandbox::new(|_, packages| {
        if !has(packages, "a") {
            (ExitStatus::Exited(127), vec![FileAccessRecord::missing("/usr/lib/liba.so")])
        } else if !has(packages, "b") {
            (
                ExitStatus::Exited(127),
                vec![
                    FileAccessRecord::present("/usr/lib/liba.so"),
                    FileAccessRecord::missing("/usr/lib/libb.so"),
                ],
            )
        } else {
            (ExitStatus::Exited(0), vec![FileAccessRecord::present("/usr/lib/liba.so")])
        }
    });
    let index = index(&[("usr/lib/liba.so", &["a"]), ("usr/lib/libb.so", &["b"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("chain"), 1).unwrap();

    let solution = &resolution.solutions()[0];
    assert_eq!(solution.packages(), &["a".to_string(), "b".to_string()]);

    let installs = sandbox.installs();
    assert_eq!(installs.len(), 2);
    let (upper, lower) = (set_of(&installs[0]), set_of(&installs[1]));
    assert!(lower.is_strict_superset_of(&upper));
}

fn set_of(packages: &[String]) -> CandidateSet {
    CandidateSet::from_packages(packages.iter().cloned())
}

#[test]
fn test_identical_inputs_identical_answers() {
    let index = index(&[("usr/bin/tool", &["a", "b"])]);

    let first_sandbox = tool_sandbox();
    let first = ResolutionEngine::new(&first_sandbox, &index, options(1))
        .resolve(&cmd("tool"), 0)
        .unwrap();
    let second_sandbox = tool_sandbox();
    let second = ResolutionEngine::new(&second_sandbox, &index, options(1))
        .resolve(&cmd("tool"), 0)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_sandbox.installs(), second_sandbox.installs());
}

#[test]
fn test_parallel_windows_match_sequential_order() {
    let index = index(&[("usr/bin/tool", &["a", "b"])]);

    let sequential = ResolutionEngine::new(&tool_sandbox(), &index, options(1))
        .resolve(&cmd("tool"), 0)
        .unwrap();
    let parallel_sandbox = tool_sandbox();
    let parallel = ResolutionEngine::new(&parallel_sandbox, &index, options(4))
        .resolve(&cmd("tool"), 0)
        .unwrap();

    assert_eq!(sequential, parallel);
    assert_eq!(parallel_sandbox.live_snapshots(), 0);
}

#[test]
fn test_supersets_of_solutions_are_pruned() {
    // b fixes the tool but then needs /usr/share/a.dat, which only a provides
    let sandbox = ScriptedSandbox::new(|_, packages| {
        if has(packages, "a") {
            (ExitStatus::Exited(0), vec![FileAccessRecord::present("/usr/bin/tool")])
        } else if has(packages, "b") {
            (
                ExitStatus::Exited(2),
                vec![
                    FileAccessRecord::present("/usr/bin/tool"),
                    FileAccessRecord::missing("/usr/share/a.dat"),
                ],
            )
        } else {
            (ExitStatus::Exited(127), vec![FileAccessRecord::missing("/usr/bin/tool")])
        }
    });
    let index = index(&[("usr/bin/tool", &["a", "b"]), ("usr/share/a.dat", &["a"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("tool"), 0).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["a"])]));
    assert!(engine.stats().skipped_superset >= 1);
    assert!(!sandbox
        .installs()
        .contains(&vec!["a".to_string(), "b".to_string()]));
}

#[test]
fn test_successful_exit_accepted_when_nothing_deeper_works() {
    // The optional config is tolerated; installing its package breaks the run
    let sandbox = ScriptedSandbox::new(|_, packages| {
        if has(packages, "opt-conf") {
            (ExitStatus::Exited(1), vec![FileAccessRecord::present("/etc/opt.conf")])
        } else {
            (ExitStatus::Exited(0), vec![FileAccessRecord::missing("/etc/opt.conf")])
        }
    });
    let index = index(&[("etc/opt.conf", &["opt-conf"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("tolerant"), 1).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![CandidateSet::new()]));
}

#[test]
fn test_unchanged_behavior_is_a_dead_end() {
    let sandbox = ScriptedSandbox::new(|_, packages| {
        if has(packages, "good") {
            (ExitStatus::Exited(0), vec![FileAccessRecord::present("/usr/lib/libq.so")])
        } else {
            (ExitStatus::Exited(127), vec![FileAccessRecord::missing("/usr/lib/libq.so")])
        }
    });
    let index = index(&[("usr/lib/libq.so", &["useless", "good"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("q"), 0).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["good"])]));
    // [useless] is never extended
    let installs = sandbox.installs();
    assert_eq!(installs.len(), 2);
    assert!(installs.iter().all(|i| i.len() == 1));
    assert_eq!(engine.stats().trials, 3);
}

#[test]
fn test_later_siblings_cancelled_once_quota_met() {
    let mut sandbox = tool_sandbox_with(&["a", "b", "c"]);
    sandbox.slow = vec!["b".to_string(), "c".to_string()];
    let index = index(&[("usr/bin/tool", &["a", "b", "c"])]);

    let started = Instant::now();
    let engine = ResolutionEngine::new(&sandbox, &index, options(3));
    let resolution = engine.resolve(&cmd("tool"), 1).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["a"])]));
    assert_eq!(engine.stats().cancelled, 2);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(sandbox.live_snapshots(), 0);
}

fn tool_sandbox_with(providers: &'static [&'static str]) -> ScriptedSandbox {
    ScriptedSandbox::new(move |_, packages| {
        if providers.iter().any(|p| has(packages, p)) {
            (ExitStatus::Exited(0), vec![FileAccessRecord::present("/usr/bin/tool")])
        } else {
            (ExitStatus::Exited(127), vec![FileAccessRecord::missing("/usr/bin/tool")])
        }
    })
}

#[test]
fn test_cancelled_search_reports_interruption() {
    let sandbox = tool_sandbox();
    let index = index(&[("usr/bin/tool", &["a"])]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let engine = ResolutionEngine::new(&sandbox, &index, options(1)).with_cancel(cancel);
    let resolution = engine.resolve(&cmd("tool"), 1).unwrap();

    let Resolution::Exhausted(partial) = resolution else {
        panic!("expected an interrupted search");
    };
    assert!(partial.interrupted);
    assert!(sandbox.installs().is_empty());
}

#[test]
fn test_multi_step_builds_on_previous_solution() {
    let sandbox = ScriptedSandbox::new(|command, packages| match command.program.as_str() {
        "./configure" if !has(packages, "m4") => {
            (ExitStatus::Exited(1), vec![FileAccessRecord::missing("/usr/bin/m4")])
        }
        "make" if !has(packages, "gcc") => {
            (ExitStatus::Exited(2), vec![FileAccessRecord::missing("/usr/bin/gcc")])
        }
        _ => (ExitStatus::Exited(0), Vec::new()),
    });
    let index = index(&[("usr/bin/m4", &["m4"]), ("usr/bin/gcc", &["gcc"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine
        .resolve_steps(&[cmd("./configure"), cmd("make")], 1)
        .unwrap();

    let solution = &resolution.solutions()[0];
    assert_eq!(solution.packages(), &["m4".to_string(), "gcc".to_string()]);
    assert_eq!(sandbox.live_snapshots(), 0);
}

#[test]
fn test_empty_step_list_is_rejected() {
    let sandbox = tool_sandbox();
    let index = index(&[]);
    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    assert!(matches!(
        engine.resolve_steps(&[], 1),
        Err(DeptraceError::Config(_))
    ));
}

#[test]
fn test_failed_install_is_backtracked() {
    let mut sandbox = tool_sandbox_with(&["broken", "good"]);
    sandbox.broken = vec!["broken".to_string()];
    let index = index(&[("usr/bin/tool", &["broken", "good"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let resolution = engine.resolve(&cmd("tool"), 1).unwrap();

    assert_eq!(resolution, Resolution::Solved(vec![set(&["good"])]));
    assert_eq!(engine.stats().aborted, 1);
    assert_eq!(sandbox.live_snapshots(), 0);
}

#[test]
fn test_unusable_backend_propagates() {
    let mut sandbox = tool_sandbox_with(&["huge"]);
    sandbox.out_of_space = vec!["huge".to_string()];
    let index = index(&[("usr/bin/tool", &["huge"])]);

    let engine = ResolutionEngine::new(&sandbox, &index, options(1));
    let err = engine.resolve(&cmd("tool"), 1).unwrap_err();

    assert!(matches!(err, DeptraceError::Backend(_)));
    assert_eq!(sandbox.live_snapshots(), 0);
}
