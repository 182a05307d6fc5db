/// Docker-backed sandbox provider
///
/// Snapshots are images. The base image gets the invoking directory copied
/// to /workdir and fresh package lists; every install runs in a throwaway
/// container that is committed as a new image. Trials run a bind-mounted
/// deptrace binary as the in-container tracer, which writes the record
/// stream and the exit status into a per-trial host directory.
use crate::config::loader::{PackageManagerConfig, ResolverConfig};
use crate::config::types::{DeptraceError, ExitStatus, Result, TrialCommand};
use crate::kernel::signal::CancelToken;
use crate::sandbox::{SandboxProvider, SnapshotHandle, TraceSource, TrialRun};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use uuid::Uuid;

/// Mount points inside trial containers
const TRACER_PATH: &str = "/usr/local/bin/deptrace-tracer";
const TRIAL_DIR: &str = "/deptrace";
const SOURCE_DIR: &str = "/src";
const WORK_DIR: &str = "/workdir";

const TRACE_FILE: &str = "trace.jsonl";
const STATUS_FILE: &str = "status.json";
const OUTPUT_FILE: &str = "output.log";

pub struct DockerSandbox {
    docker: String,
    base_image: String,
    repository: String,
    package_manager: PackageManagerConfig,
    tracer_binary: PathBuf,
    source_dir: PathBuf,
    scratch_dir: PathBuf,
    follow_forks: bool,
    /// Distinguishes this run's images from concurrent runs
    run_tag: String,
}

impl DockerSandbox {
    /// `source_dir` is copied into the base image; `scratch_dir` holds the
    /// per-trial directories shared with containers
    pub fn new(config: &ResolverConfig, source_dir: PathBuf, scratch_dir: PathBuf) -> Result<Self> {
        let tracer_binary = match &config.docker.tracer_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                DeptraceError::Backend(format!("cannot locate the deptrace executable: {}", e))
            })?,
        };
        let run_tag = Uuid::new_v4().simple().to_string()[..8].to_string();
        Ok(Self {
            docker: config.docker.binary.clone(),
            base_image: config.base_image(),
            repository: config.docker.snapshot_repository.clone(),
            package_manager: config.package_manager.clone(),
            tracer_binary,
            source_dir,
            scratch_dir,
            follow_forks: config.follow_forks,
            run_tag,
        })
    }

    /// Fails with `Backend` when the docker daemon cannot be reached
    pub fn check_available(&self) -> Result<()> {
        let output = self
            .command(&["version", "--format", "{{.Server.Version}}"])
            .output()
            .map_err(|e| DeptraceError::Backend(format!("cannot run `{}`: {}", self.docker, e)))?;
        if !output.status.success() {
            return Err(DeptraceError::Backend(format!(
                "docker daemon unavailable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        log::info!(
            "Using docker {} with base image {}",
            String::from_utf8_lossy(&output.stdout).trim(),
            self.base_image
        );
        Ok(())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args).stdin(Stdio::null());
        cmd
    }

    /// Run a docker subcommand to completion
    fn exec(&self, args: &[&str]) -> Result<Output> {
        log::debug!("{} {}", self.docker, args.join(" "));
        self.command(args)
            .output()
            .map_err(|e| DeptraceError::Sandbox(format!("cannot run `{}`: {}", self.docker, e)))
    }

    fn exec_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.exec(args)?;
        if !output.status.success() {
            return Err(DeptraceError::Sandbox(format!(
                "`docker {}` failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    fn remove_container(&self, name: &str) {
        if let Ok(output) = self.exec(&["rm", "-f", name]) {
            if !output.status.success() {
                log::warn!(
                    "Failed to remove container {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
    }

    /// Stable digest of a package set, independent of install order
    pub fn set_digest(packages: &[String]) -> String {
        let mut sorted: Vec<&str> = packages.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let digest = Sha256::digest(sorted.join("\n").as_bytes());
        format!("{:x}", digest)[..16].to_string()
    }

    /// Image tag for a committed package set. The digest names the set;
    /// the suffix keeps two commits of one set from stealing each other's tag.
    pub fn snapshot_tag(&self, packages: &[String]) -> String {
        self.unique_tag(&Self::set_digest(packages))
    }

    fn unique_tag(&self, prefix: &str) -> String {
        format!(
            "{}:{}-{}-{}",
            self.repository,
            self.run_tag,
            prefix,
            Uuid::new_v4().simple()
        )
    }

    /// Arguments of the `docker run` that executes one traced trial
    pub fn trial_args(
        &self,
        image: &str,
        container: &str,
        trial_dir: &Path,
        cwd_mirror: &Path,
        command: &TrialCommand,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container.into(),
            "--cap-add".into(),
            "SYS_PTRACE".into(),
            "-v".into(),
            format!("{}:{}:ro", cwd_mirror.display(), SOURCE_DIR),
            "-v".into(),
            format!("{}:{}", trial_dir.display(), TRIAL_DIR),
            "-v".into(),
            format!("{}:{}:ro", self.tracer_binary.display(), TRACER_PATH),
            "-w".into(),
            WORK_DIR.into(),
            image.into(),
            TRACER_PATH.into(),
            "trace".into(),
            "--output".into(),
            format!("{}/{}", TRIAL_DIR, TRACE_FILE),
            "--status".into(),
            format!("{}/{}", TRIAL_DIR, STATUS_FILE),
        ];
        if self.follow_forks {
            args.push("--follow-forks".into());
        }
        args.push("--".into());
        args.extend(command.argv());
        args
    }

    fn create_trial_dir(&self) -> Result<PathBuf> {
        let dir = self
            .scratch_dir
            .join(format!("trial-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).map_err(|e| {
            DeptraceError::Sandbox(format!(
                "Failed to create trial directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }
}

/// Install output that means no further install can succeed either
fn is_out_of_space(output: &[u8]) -> bool {
    String::from_utf8_lossy(output).contains("enough free space")
}

fn output_tail(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

impl SandboxProvider for DockerSandbox {
    fn new_snapshot(&self, base: Option<&SnapshotHandle>) -> Result<SnapshotHandle> {
        if let Some(base) = base {
            let tag = self.unique_tag("branch");
            self.exec_checked(&["tag", &base.id, &tag])?;
            return Ok(SnapshotHandle::new(tag, base.packages.clone()));
        }

        let container = format!("deptrace-base-{}", Uuid::new_v4().simple());
        let setup = format!(
            "cp -r {}/. {} && {}",
            SOURCE_DIR, WORK_DIR, self.package_manager.update_command
        );
        let mount = format!("{}:{}:ro", self.source_dir.display(), SOURCE_DIR);
        log::info!("Preparing base snapshot from {}", self.base_image);

        let output = self.exec(&[
            "run",
            "--name",
            &container,
            "-v",
            &mount,
            &self.base_image,
            "sh",
            "-c",
            &setup,
        ])?;
        if !output.status.success() {
            self.remove_container(&container);
            return Err(DeptraceError::Backend(format!(
                "base snapshot setup in {} failed:\n{}",
                self.base_image,
                output_tail(&output)
            )));
        }

        let tag = self.snapshot_tag(&[]);
        let committed = self.exec_checked(&["commit", &container, &tag]);
        self.remove_container(&container);
        committed.map_err(|e| DeptraceError::Backend(e.to_string()))?;
        Ok(SnapshotHandle::new(tag, Vec::new()))
    }

    fn install(&self, snapshot: &SnapshotHandle, package: &str) -> Result<SnapshotHandle> {
        let container = format!("deptrace-install-{}", Uuid::new_v4().simple());
        let line = self.package_manager.install_line(&[package.to_string()]);
        log::info!("Installing {} on top of [{}]", package, snapshot.packages.join(", "));

        let output = self.exec(&["run", "--name", &container, &snapshot.id, "sh", "-c", &line])?;
        if !output.status.success() {
            self.remove_container(&container);
            if is_out_of_space(&output.stdout) || is_out_of_space(&output.stderr) {
                return Err(DeptraceError::Backend(
                    "not enough free space for docker images; free some space and retry"
                        .to_string(),
                ));
            }
            return Err(DeptraceError::Sandbox(format!(
                "installing {} failed:\n{}",
                package,
                output_tail(&output)
            )));
        }

        let mut packages = snapshot.packages.clone();
        packages.push(package.to_string());
        let tag = self.snapshot_tag(&packages);
        let committed = self.exec_checked(&["commit", &container, &tag]);
        self.remove_container(&container);
        committed?;
        Ok(SnapshotHandle::new(tag, packages))
    }

    fn run(
        &self,
        snapshot: &SnapshotHandle,
        command: &TrialCommand,
        cwd_mirror: &Path,
        cancel: &CancelToken,
    ) -> Result<TrialRun> {
        let trial_dir = self.create_trial_dir()?;
        let container = format!("deptrace-trial-{}", Uuid::new_v4().simple());
        let args = self.trial_args(&snapshot.id, &container, &trial_dir, cwd_mirror, command);

        let log_path = trial_dir.join(OUTPUT_FILE);
        let (stdout, stderr) = File::create(&log_path)
            .and_then(|file| Ok((file.try_clone()?, file)))
            .map_err(|e| {
                DeptraceError::Sandbox(format!("cannot create {}: {}", log_path.display(), e))
            })?;
        let mut child = Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| DeptraceError::Sandbox(format!("cannot run `{}`: {}", self.docker, e)))?;

        let docker_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if cancel.is_cancelled() {
                        log::debug!("Cancelling trial container {}", container);
                        let _ = self.exec(&["kill", &container]);
                        let _ = child.wait();
                        return Err(DeptraceError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    let _ = self.exec(&["kill", &container]);
                    return Err(DeptraceError::Sandbox(format!("wait(docker run): {}", e)));
                }
            }
        };

        let status_path = trial_dir.join(STATUS_FILE);
        let exit: ExitStatus = match File::open(&status_path) {
            Ok(file) => serde_json::from_reader(file).map_err(|e| {
                DeptraceError::Sandbox(format!("unreadable trial status {}: {}", status_path.display(), e))
            })?,
            Err(_) => {
                return Err(DeptraceError::Sandbox(format!(
                    "tracer in {} left no exit status (docker exited with {}); see {}",
                    container,
                    docker_status,
                    log_path.display()
                )));
            }
        };

        Ok(TrialRun {
            exit,
            trace: TraceSource::Stream(trial_dir.join(TRACE_FILE)),
        })
    }

    fn discard(&self, snapshot: SnapshotHandle) {
        match self.exec(&["rmi", &snapshot.id]) {
            Ok(output) if output.status.success() => {}
            Ok(output) => log::warn!(
                "Failed to remove snapshot {}: {}",
                snapshot.id,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => log::warn!("Failed to remove snapshot {}: {}", snapshot.id, e),
        }
    }
}
