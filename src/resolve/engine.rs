//! Backtracking resolution search.
//!
//! The search is a depth-first walk over a [`SearchTree`] driven by an
//! explicit work list. Each pending node is a trial; a trial that improves
//! on its parent is expanded into one child per package the index offers
//! for its unexplained missing paths. Paths are taken in first-observed
//! order and providers in index order, so equal inputs give equal output.

use crate::config::loader::ResolverConfig;
use crate::config::types::{DeptraceError, ExitStatus, FileAccessRecord, Result, TrialCommand};
use crate::index::PackageIndex;
use crate::kernel::signal::CancelToken;
use crate::observability::journal::{self, Journal, SearchEvent};
use crate::resolve::candidate::CandidateSet;
use crate::resolve::node::{NodeId, SearchTree, TrialState};
use crate::resolve::trial::{
    assess, missing_multiset, missing_paths, DedupCache, TrialEnd, TrialJob, TrialResult,
    TrialRunner,
};
use crate::sandbox::{SandboxProvider, SnapshotHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Sibling trials run at once
    pub parallelism: usize,
    pub success_exit_codes: Vec<i32>,
    pub trial_timeout: Option<Duration>,
    /// Invoking directory mirrored into every trial
    pub cwd: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            success_exit_codes: vec![0],
            trial_timeout: None,
            cwd: PathBuf::from("."),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &ResolverConfig, cwd: PathBuf) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            success_exit_codes: config.success_exit_codes.clone(),
            trial_timeout: config.trial_timeout(),
            cwd,
        }
    }

    pub fn is_success(&self, exit: ExitStatus) -> bool {
        exit.code()
            .is_some_and(|code| self.success_exit_codes.contains(&code))
    }
}

/// Counters across every search an engine ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub trials: usize,
    pub installs: usize,
    pub skipped_tried: usize,
    /// Nodes judged from a stored result instead of a new trial
    pub reused: usize,
    pub skipped_superset: usize,
    pub aborted: usize,
    pub cancelled: usize,
}

/// Diagnostic detail of a search that found nothing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartialResolution {
    /// Set that left the fewest unexplained missing paths
    pub best_partial: CandidateSet,
    /// Paths still missing under `best_partial`
    pub unresolved_paths: Vec<String>,
    pub exit: Option<ExitStatus>,
    pub last_tried: CandidateSet,
    /// Search stopped early by a signal
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Satisfying sets in discovery order; may be fewer than requested
    Solved(Vec<CandidateSet>),
    Exhausted(PartialResolution),
}

impl Resolution {
    pub fn solutions(&self) -> &[CandidateSet] {
        match self {
            Resolution::Solved(solutions) => solutions,
            Resolution::Exhausted(_) => &[],
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, Resolution::Solved(_))
    }
}

pub struct ResolutionEngine<'a> {
    sandbox: &'a dyn SandboxProvider,
    index: &'a dyn PackageIndex,
    options: EngineOptions,
    cancel: CancelToken,
    journal: Option<&'a Journal>,
    stats: Mutex<EngineStats>,
}

impl<'a> ResolutionEngine<'a> {
    pub fn new(
        sandbox: &'a dyn SandboxProvider,
        index: &'a dyn PackageIndex,
        options: EngineOptions,
    ) -> Self {
        Self {
            sandbox,
            index,
            options,
            cancel: CancelToken::new(),
            journal: None,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Stop searching once `cancel` fires; running trials are abandoned
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_journal(mut self, journal: &'a Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn bump(&self, update: impl FnOnce(&mut EngineStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn emit(&self, event: SearchEvent) {
        journal::record(self.journal, event);
    }

    /// Find up to `max_solutions` package sets (0 means all) under which
    /// `command` succeeds
    pub fn resolve(&self, command: &TrialCommand, max_solutions: usize) -> Result<Resolution> {
        self.resolve_steps(std::slice::from_ref(command), max_solutions)
    }

    /// Resolve a sequence of commands; every step starts from one solution
    /// of the step before it
    pub fn resolve_steps(
        &self,
        commands: &[TrialCommand],
        max_solutions: usize,
    ) -> Result<Resolution> {
        if commands.is_empty() {
            return Err(DeptraceError::Config("no command to resolve".to_string()));
        }

        let mut found = Vec::new();
        let mut best: Option<(usize, PartialResolution)> = None;
        self.resolve_step(commands, 0, &CandidateSet::new(), max_solutions, &mut found, &mut best)?;

        if !found.is_empty() {
            return Ok(Resolution::Solved(found));
        }
        let partial = best.map(|(_, partial)| partial).unwrap_or_default();
        self.emit(SearchEvent::Exhausted {
            best_partial: partial.best_partial.to_vec(),
            unresolved_paths: partial.unresolved_paths.clone(),
        });
        Ok(Resolution::Exhausted(partial))
    }

    fn resolve_step(
        &self,
        commands: &[TrialCommand],
        step: usize,
        base: &CandidateSet,
        max_solutions: usize,
        found: &mut Vec<CandidateSet>,
        best: &mut Option<(usize, PartialResolution)>,
    ) -> Result<()> {
        let last = step + 1 == commands.len();
        let quota = (last && max_solutions > 0).then(|| max_solutions - found.len());
        let enough = |found: &Vec<CandidateSet>| max_solutions > 0 && found.len() >= max_solutions;

        let mut search = Search::new(self, &commands[step], base.clone(), quota);
        let partial = search.run(&mut |solution: &CandidateSet| {
            if last {
                found.push(solution.clone());
            } else {
                log::info!("Step {} solved with [{}]", step + 1, solution);
                self.resolve_step(commands, step + 1, solution, max_solutions, found, best)?;
            }
            Ok(enough(found))
        })?;

        if let Some(partial) = partial {
            if best.as_ref().map_or(true, |(s, _)| step >= *s) {
                *best = Some((step, partial));
            }
        }
        Ok(())
    }
}

enum Work {
    Visit(NodeId),
    /// Every child of the node has been visited
    Finish(NodeId),
}

/// State of one single-command search
struct Search<'s, 'a> {
    engine: &'s ResolutionEngine<'a>,
    command: &'s TrialCommand,
    tree: SearchTree,
    cache: DedupCache,
    /// Snapshots of sets judged unchanged, kept for reuse under another parent
    parked: HashMap<CandidateSet, SnapshotHandle>,
    solutions: Vec<CandidateSet>,
    quota: Option<usize>,
    last_tried: CandidateSet,
    done: bool,
    interrupted: bool,
}

type SolutionSink<'f> = dyn FnMut(&CandidateSet) -> Result<bool> + 'f;

impl<'s, 'a> Search<'s, 'a> {
    fn new(
        engine: &'s ResolutionEngine<'a>,
        command: &'s TrialCommand,
        base: CandidateSet,
        quota: Option<usize>,
    ) -> Self {
        Self {
            engine,
            command,
            tree: SearchTree::new(base.clone()),
            cache: DedupCache::new(),
            parked: HashMap::new(),
            solutions: Vec::new(),
            quota,
            last_tried: base,
            done: false,
            interrupted: false,
        }
    }

    fn runner(&self) -> TrialRunner<'s> {
        TrialRunner {
            sandbox: self.engine.sandbox,
            command: self.command,
            cwd: &self.engine.options.cwd,
            timeout: self.engine.options.trial_timeout,
        }
    }

    /// Run the search; returns the partial result when nothing was found
    fn run(&mut self, on_solution: &mut SolutionSink<'_>) -> Result<Option<PartialResolution>> {
        let root = self.tree.root();
        let base = self.tree.get(root).candidates.clone();
        self.engine.emit(SearchEvent::SearchStarted {
            command: self.command.to_string(),
            base: base.to_vec(),
            max_solutions: self.quota.unwrap_or(0),
        });

        let snapshot = self.base_snapshot(&base)?;
        self.tree.get_mut(root).snapshot = Some(snapshot);
        self.run_window(&[root])?;

        let mut work = vec![Work::Visit(root)];
        while let Some(item) = work.pop() {
            if self.done {
                break;
            }
            if self.engine.cancel.is_cancelled() {
                log::warn!("Search interrupted; reporting what was found so far");
                self.interrupted = true;
                break;
            }
            match item {
                Work::Visit(id) => self.visit(id, &mut work, on_solution)?,
                Work::Finish(id) => self.finish(id, on_solution)?,
            }
        }

        if self.solutions.is_empty() {
            Ok(Some(self.partial()))
        } else {
            Ok(None)
        }
    }

    /// Base environment with the step's base packages installed in order
    fn base_snapshot(&self, base: &CandidateSet) -> Result<SnapshotHandle> {
        let sandbox = self.engine.sandbox;
        let mut snapshot = sandbox.new_snapshot(None)?;
        for package in base.packages() {
            let installed = match sandbox.install(&snapshot, package) {
                Ok(installed) => installed,
                Err(e) => {
                    sandbox.discard(snapshot);
                    return Err(e);
                }
            };
            self.engine.bump(|s| s.installs += 1);
            if installed.id != snapshot.id {
                sandbox.discard(snapshot);
            }
            snapshot = installed;
        }
        Ok(snapshot)
    }

    fn skip_superset(&self, id: NodeId) -> bool {
        let candidates = &self.tree.get(id).candidates;
        self.solutions.iter().any(|s| candidates.is_superset_of(s))
    }

    fn visit(
        &mut self,
        id: NodeId,
        work: &mut Vec<Work>,
        on_solution: &mut SolutionSink<'_>,
    ) -> Result<()> {
        if id != self.tree.root() && self.skip_superset(id) {
            self.engine.bump(|s| s.skipped_superset += 1);
            self.engine.emit(SearchEvent::Skipped {
                candidates: self.tree.get(id).candidates.to_vec(),
                reason: "superset of a solution already found".to_string(),
            });
            self.release_snapshot(id);
            return Ok(());
        }

        if self.tree.get(id).state == TrialState::Pending {
            let candidates = self.tree.get(id).candidates.clone();
            match self.cache.get(&candidates) {
                // The subtree of an expanded set does not depend on its parent
                Some(stored) if stored.improved() => {
                    self.skip_tried(&candidates, "subtree already explored");
                    return Ok(());
                }
                Some(stored) => self.reuse(id, &stored)?,
                None if self.cache.contains(&candidates) => {
                    self.skip_tried(&candidates, "trial aborted earlier");
                    return Ok(());
                }
                None => {
                    let window = self.window_from(id);
                    self.run_window(&window)?;
                }
            }
        }

        let node = self.tree.get(id);
        match node.state {
            TrialState::Succeeded => {
                self.accept(id, on_solution)?;
                self.release_snapshot(id);
            }
            TrialState::Improved => {
                let children = self.expand(id);
                let solutions = self.solutions.len();
                let node = self.tree.get_mut(id);
                node.solutions_before = solutions;
                work.push(Work::Finish(id));
                for child in children.into_iter().rev() {
                    work.push(Work::Visit(child));
                }
            }
            TrialState::NoChange => {
                self.engine.emit(SearchEvent::Backtrack {
                    node: id,
                    candidates: node.candidates.to_vec(),
                    reason: "same exit status and missing files as its parent".to_string(),
                });
                self.park_snapshot(id);
            }
            TrialState::Aborted => {
                self.engine.emit(SearchEvent::Backtrack {
                    node: id,
                    candidates: node.candidates.to_vec(),
                    reason: "trial aborted".to_string(),
                });
            }
            TrialState::Pending
            | TrialState::Running
            | TrialState::Exhausted
            | TrialState::Cancelled => {}
        }
        Ok(())
    }

    fn skip_tried(&self, candidates: &CandidateSet, reason: &str) {
        self.engine.bump(|s| s.skipped_tried += 1);
        self.engine.emit(SearchEvent::Skipped {
            candidates: candidates.to_vec(),
            reason: reason.to_string(),
        });
    }

    /// Judge the stored result of an already tried set against this node's
    /// parent; nothing is run or installed unless the node gets expanded
    /// and its set's snapshot is gone
    fn reuse(&mut self, id: NodeId, stored: &TrialResult) -> Result<()> {
        let result = classify(self.engine, &self.tree, id, stored.exit, &stored.records)?;
        self.engine.bump(|s| s.reused += 1);
        self.engine.emit(SearchEvent::Reused {
            node: id,
            candidates: result.candidates.to_vec(),
            state: result.outcome,
        });

        if result.outcome == TrialState::Improved {
            if let Err(e) = self.adopt_snapshot(id) {
                if !e.is_trial_local() {
                    return Err(e);
                }
                self.engine.bump(|s| s.aborted += 1);
                log::warn!("Could not rebuild [{}]: {}", result.candidates, e);
                self.tree.get_mut(id).state = TrialState::Aborted;
                return Ok(());
            }
        }

        let result = Arc::new(result);
        self.cache.complete(&result.candidates, Arc::clone(&result));
        let node = self.tree.get_mut(id);
        node.state = result.outcome;
        node.result = Some(result);
        Ok(())
    }

    /// Give `id` the snapshot parked for its set, or install its package
    /// over the parent again when none was kept
    fn adopt_snapshot(&mut self, id: NodeId) -> Result<()> {
        if self.tree.get(id).snapshot.is_some() {
            return Ok(());
        }
        let node = self.tree.get(id);
        let (candidates, package, parent) = (node.candidates.clone(), node.package.clone(), node.parent);

        let snapshot = match self.parked.remove(&candidates) {
            Some(snapshot) => snapshot,
            None => {
                let base = parent.and_then(|p| self.tree.get(p).snapshot.clone());
                let (Some(base), Some(package)) = (base, package) else {
                    return Err(DeptraceError::Sandbox(format!(
                        "no live snapshot to rebuild trial #{} from",
                        id
                    )));
                };
                let snapshot = self.runner().materialize(&base, &package)?;
                self.engine.bump(|s| s.installs += 1);
                snapshot
            }
        };
        self.tree.get_mut(id).snapshot = Some(snapshot);
        Ok(())
    }

    fn park_snapshot(&mut self, id: NodeId) {
        let Some(snapshot) = self.tree.get_mut(id).snapshot.take() else {
            return;
        };
        let candidates = self.tree.get(id).candidates.clone();
        if let Some(previous) = self.parked.insert(candidates, snapshot) {
            self.engine.sandbox.discard(previous);
        }
    }

    /// `id` plus its next pending siblings, up to the parallelism limit
    fn window_from(&self, id: NodeId) -> Vec<NodeId> {
        let mut window = vec![id];
        for sibling in self.tree.later_siblings(id) {
            if window.len() >= self.engine.options.parallelism {
                break;
            }
            let node = self.tree.get(sibling);
            if node.state != TrialState::Pending
                || self.cache.contains(&node.candidates)
                || self.skip_superset(sibling)
                || window
                    .iter()
                    .any(|w| self.tree.get(*w).candidates == node.candidates)
            {
                continue;
            }
            window.push(sibling);
        }
        window
    }

    fn run_window(&mut self, window: &[NodeId]) -> Result<()> {
        let mut jobs = Vec::with_capacity(window.len());
        for &id in window {
            let node = self.tree.get(id);
            let base = match node.parent {
                Some(parent) => self.tree.get(parent).snapshot.clone(),
                None => node.snapshot.clone(),
            }
            .ok_or_else(|| {
                DeptraceError::Sandbox(format!("no live snapshot to branch trial #{} from", id))
            })?;
            jobs.push(TrialJob {
                node: id,
                candidates: node.candidates.clone(),
                base,
                package: node.package.clone(),
            });
        }
        for job in &jobs {
            self.cache.claim(&job.candidates);
            self.last_tried = job.candidates.clone();
            let node = self.tree.get_mut(job.node);
            node.state = TrialState::Running;
            let depth = node.depth;
            self.engine.emit(SearchEvent::TrialStarted {
                node: job.node,
                depth,
                candidates: job.candidates.to_vec(),
            });
        }

        let needed = self
            .quota
            .map(|quota| quota.saturating_sub(self.solutions.len()));
        let mut assessed: Vec<Option<Result<TrialResult>>> = jobs.iter().map(|_| None).collect();
        let ends = {
            let runner = self.runner();
            let tree = &self.tree;
            let engine = self.engine;
            runner.run_window(&jobs, &engine.cancel, needed, |idx, end| {
                let TrialEnd::Completed { exit, records, .. } = end else {
                    return false;
                };
                let result = classify(engine, tree, jobs[idx].node, *exit, records);
                let success = matches!(&result, Ok(r) if r.outcome == TrialState::Succeeded);
                assessed[idx] = Some(result);
                success
            })
        };

        let mut first_error = None;
        for ((job, end), result) in jobs.iter().zip(ends).zip(assessed) {
            if let Err(e) = self.record_end(job, end, result) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record_end(
        &mut self,
        job: &TrialJob,
        end: TrialEnd,
        assessed: Option<Result<TrialResult>>,
    ) -> Result<()> {
        match end {
            TrialEnd::Completed {
                snapshot,
                exit,
                records,
            } => {
                self.engine.bump(|s| {
                    s.trials += 1;
                    if job.package.is_some() {
                        s.installs += 1;
                    }
                });
                self.tree.get_mut(job.node).snapshot = Some(snapshot);
                let result = match assessed {
                    Some(result) => result,
                    None => classify(self.engine, &self.tree, job.node, exit, &records),
                }?;
                let result = Arc::new(result);
                self.cache.complete(&job.candidates, Arc::clone(&result));
                self.engine.emit(SearchEvent::TrialFinished {
                    node: job.node,
                    candidates: job.candidates.to_vec(),
                    state: result.outcome,
                    exit: Some(result.exit),
                    missing: result.missing_paths.len(),
                    unexplained: result.unexplained_paths.len(),
                });
                let node = self.tree.get_mut(job.node);
                node.state = result.outcome;
                node.result = Some(result);
                Ok(())
            }
            TrialEnd::Failed(e) => {
                self.cache.fail(&job.candidates);
                self.tree.get_mut(job.node).state = TrialState::Aborted;
                // Without a baseline there is nothing to compare children against
                if !e.is_trial_local() || job.node == self.tree.root() {
                    return Err(e);
                }
                self.engine.bump(|s| s.aborted += 1);
                log::warn!("Trial with [{}] aborted: {}", job.candidates, e);
                self.engine.emit(SearchEvent::TrialFinished {
                    node: job.node,
                    candidates: job.candidates.to_vec(),
                    state: TrialState::Aborted,
                    exit: None,
                    missing: 0,
                    unexplained: 0,
                });
                Ok(())
            }
            TrialEnd::Cancelled => {
                self.cache.release(&job.candidates);
                self.engine.bump(|s| s.cancelled += 1);
                log::debug!("Trial with [{}] cancelled", job.candidates);
                // Cut by a sibling's success; it may still be needed later
                self.tree.get_mut(job.node).state = if self.engine.cancel.is_cancelled() {
                    TrialState::Cancelled
                } else {
                    TrialState::Pending
                };
                Ok(())
            }
        }
    }

    /// Add one pending child per offered package
    fn expand(&mut self, id: NodeId) -> Vec<NodeId> {
        let Some(result) = self.tree.get(id).result.clone() else {
            return Vec::new();
        };
        let mut children = Vec::new();
        for candidate in &result.next_candidates {
            if self.tree.get(id).candidates.contains(&candidate.package) {
                continue;
            }
            children.push(self.tree.add_child(id, &candidate.package));
        }
        self.tree.get_mut(id).expanded = true;
        if children.is_empty() {
            self.engine.emit(SearchEvent::Backtrack {
                node: id,
                candidates: result.candidates.to_vec(),
                reason: format!(
                    "no package provides any of {} missing path(s)",
                    result.missing_paths.len()
                ),
            });
        }
        children
    }

    /// Subtree of `id` is done; fall back to accepting the node itself when
    /// it exited successfully and nothing below it worked
    fn finish(&mut self, id: NodeId, on_solution: &mut SolutionSink<'_>) -> Result<()> {
        let node = self.tree.get(id);
        let found_below = self.solutions.len() > node.solutions_before;
        if !found_below {
            let exit_ok = node
                .result
                .as_ref()
                .is_some_and(|r| self.engine.options.is_success(r.exit));
            if exit_ok {
                log::info!(
                    "No deeper solution; accepting [{}] since the command exited successfully",
                    node.candidates
                );
                self.accept(id, on_solution)?;
            } else {
                self.engine.emit(SearchEvent::Backtrack {
                    node: id,
                    candidates: node.candidates.to_vec(),
                    reason: "every branch below was a dead end".to_string(),
                });
                self.tree.get_mut(id).state = TrialState::Exhausted;
            }
        }
        self.release_snapshot(id);
        Ok(())
    }

    fn accept(&mut self, id: NodeId, on_solution: &mut SolutionSink<'_>) -> Result<()> {
        let candidates = self.tree.get(id).candidates.clone();
        if self.solutions.iter().any(|s| candidates.is_superset_of(s)) {
            self.engine.bump(|s| s.skipped_superset += 1);
            return Ok(());
        }
        self.solutions.push(candidates.clone());
        self.engine.emit(SearchEvent::Solution {
            index: self.solutions.len() - 1,
            candidates: candidates.to_vec(),
        });
        if on_solution(&candidates)? {
            self.done = true;
        }
        Ok(())
    }

    fn release_snapshot(&mut self, id: NodeId) {
        if let Some(snapshot) = self.tree.get_mut(id).snapshot.take() {
            self.engine.sandbox.discard(snapshot);
        }
    }

    /// Best partial: fewest unexplained paths, then deeper, then earlier
    fn partial(&self) -> PartialResolution {
        let best = self
            .tree
            .iter()
            .filter(|n| matches!(n.state, TrialState::Improved | TrialState::Exhausted))
            .filter_map(|n| n.result.as_ref().map(|r| (n, r)))
            .min_by_key(|(n, r)| (r.unexplained_paths.len(), std::cmp::Reverse(n.depth), n.id));

        match best {
            Some((node, result)) => PartialResolution {
                best_partial: node.candidates.clone(),
                unresolved_paths: result.missing_paths.clone(),
                exit: Some(result.exit),
                last_tried: self.last_tried.clone(),
                interrupted: self.interrupted,
            },
            None => PartialResolution {
                best_partial: self.tree.get(self.tree.root()).candidates.clone(),
                last_tried: self.last_tried.clone(),
                interrupted: self.interrupted,
                ..Default::default()
            },
        }
    }
}

impl Drop for Search<'_, '_> {
    fn drop(&mut self) {
        let live: Vec<NodeId> = self
            .tree
            .iter()
            .filter(|n| n.snapshot.is_some())
            .map(|n| n.id)
            .collect();
        for id in live {
            self.release_snapshot(id);
        }
        for (_, snapshot) in self.parked.drain() {
            self.engine.sandbox.discard(snapshot);
        }
    }
}

/// Assess a completed trial against the index and its parent's result
fn classify(
    engine: &ResolutionEngine<'_>,
    tree: &SearchTree,
    id: NodeId,
    exit: ExitStatus,
    records: &[FileAccessRecord],
) -> Result<TrialResult> {
    let node = tree.get(id);
    let missing = missing_paths(records);
    let assessment = assess(engine.index, &node.candidates, &missing)?;

    let outcome = if engine.options.is_success(exit) && assessment.unexplained_paths.is_empty() {
        TrialState::Succeeded
    } else {
        let parent_result = node.parent.and_then(|p| tree.get(p).result.as_ref());
        match parent_result {
            Some(parent) if parent.exit == exit && parent.missing_multiset() == missing_multiset(records) => {
                TrialState::NoChange
            }
            _ => TrialState::Improved,
        }
    };

    Ok(TrialResult {
        candidates: node.candidates.clone(),
        exit,
        records: records.to_vec(),
        missing_paths: missing,
        unexplained_paths: assessment.unexplained_paths,
        unresolvable_paths: assessment.unresolvable_paths,
        next_candidates: assessment.next_candidates,
        outcome,
    })
}
