/// Configuration loading from deptrace.json and /etc/os-release
use crate::config::types::{DeptraceError, IndexKey, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Platform used when the host cannot be described (non-Linux, unreadable os-release)
pub const DEFAULT_PLATFORM: (&str, &str, &str) = ("ubuntu", "noble", "amd64");

/// Package manager commands run inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManagerConfig {
    pub name: String,
    /// Shell command refreshing package lists in the base snapshot
    pub update_command: String,
    /// Shell command prefix; package names are appended space-separated
    pub install_command: String,
}

impl Default for PackageManagerConfig {
    fn default() -> Self {
        Self {
            name: "apt".to_string(),
            update_command: "apt-get update -y".to_string(),
            install_command: "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends"
                .to_string(),
        }
    }
}

impl PackageManagerConfig {
    pub fn install_line(&self, packages: &[String]) -> String {
        format!("{} {}", self.install_command, packages.join(" "))
    }
}

/// Docker adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// `docker` executable
    pub binary: String,
    /// Base image; `None` derives `{os}:{release}`
    pub base_image: Option<String>,
    /// Repository used for committed snapshot images
    pub snapshot_repository: String,
    /// Path of the deptrace binary mounted into trial containers;
    /// `None` uses the running executable
    pub tracer_binary: Option<PathBuf>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            base_image: None,
            snapshot_repository: "deptrace-snapshot".to_string(),
            tracer_binary: None,
        }
    }
}

/// Distribution mirror the package index is downloaded from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory listing whose subdirectories are releases
    pub dists_url: String,
    /// Listing URL; `{os}`, `{release}` and `{arch}` are substituted
    pub contents_url: String,
    /// Whole-request limit for one download
    pub timeout_secs: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            dists_url: "http://security.ubuntu.com/ubuntu/dists/".to_string(),
            contents_url: "http://security.ubuntu.com/ubuntu/dists/{release}/Contents-{arch}.gz"
                .to_string(),
            timeout_secs: 900,
        }
    }
}

/// Resolver configuration (deptrace.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub os: String,
    pub release: String,
    pub arch: String,
    pub package_manager: PackageManagerConfig,
    pub docker: DockerConfig,
    pub mirror: MirrorConfig,
    /// Number of solutions to enumerate; 0 enumerates all
    pub max_solutions: usize,
    /// Sibling trials run concurrently
    pub parallelism: usize,
    /// Wall-clock bound per trial in seconds
    pub trial_timeout_secs: Option<u64>,
    /// Exit codes that count as success
    pub success_exit_codes: Vec<i32>,
    /// Follow fork/vfork/clone children while tracing
    pub follow_forks: bool,
    /// Override for the index cache directory
    pub cache_dir: Option<PathBuf>,
    /// Index files older than this are reported as stale
    pub index_max_age_days: Option<u64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let (os, release, arch) = PlatformInfo::detect()
            .map(|p| (p.os, p.release, p.arch))
            .unwrap_or_else(|| {
                (
                    DEFAULT_PLATFORM.0.to_string(),
                    DEFAULT_PLATFORM.1.to_string(),
                    DEFAULT_PLATFORM.2.to_string(),
                )
            });
        Self {
            os,
            release,
            arch,
            package_manager: PackageManagerConfig::default(),
            docker: DockerConfig::default(),
            mirror: MirrorConfig::default(),
            max_solutions: 1,
            parallelism: 1,
            trial_timeout_secs: None,
            success_exit_codes: vec![0],
            follow_forks: false,
            cache_dir: None,
            index_max_age_days: Some(30),
        }
    }
}

impl ResolverConfig {
    /// Load configuration from a JSON file; missing keys take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeptraceError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ResolverConfig = serde_json::from_str(&content).map_err(|e| {
            DeptraceError::Config(format!("Failed to parse config JSON {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load ./deptrace.json if present, otherwise defaults
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| DeptraceError::Config(format!("Failed to get current directory: {}", e)))?
            .join("deptrace.json");

        if !config_path.exists() {
            log::debug!("No deptrace.json in current directory, using defaults");
            return Ok(Self::default());
        }

        Self::load_from_file(config_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(DeptraceError::Config("parallelism must be at least 1".to_string()));
        }
        if self.success_exit_codes.is_empty() {
            return Err(DeptraceError::Config(
                "success_exit_codes must name at least one exit code".to_string(),
            ));
        }
        if self.mirror.timeout_secs == 0 {
            return Err(DeptraceError::Config("mirror.timeout_secs must be positive".to_string()));
        }
        if self.package_manager.install_command.trim().is_empty() {
            return Err(DeptraceError::Config("install_command is empty".to_string()));
        }
        Ok(())
    }

    pub fn index_key(&self) -> IndexKey {
        IndexKey::new(
            self.package_manager.name.clone(),
            self.os.clone(),
            self.release.clone(),
            self.arch.clone(),
        )
    }

    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_secs.map(Duration::from_secs)
    }

    pub fn index_max_age(&self) -> Option<Duration> {
        self.index_max_age_days
            .map(|days| Duration::from_secs(days * 24 * 60 * 60))
    }

    /// Directory holding persisted package indexes
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(xdg).join("deptrace");
        }
        if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(home).join(".cache").join("deptrace");
        }
        // SAFETY: geteuid has no preconditions.
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("deptrace-cache-uid-{}", euid))
    }

    pub fn base_image(&self) -> String {
        self.docker
            .base_image
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.os, self.release))
    }
}

/// Host platform as described by /etc/os-release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: String,
    pub release: String,
    pub arch: String,
}

impl PlatformInfo {
    /// Describe the running host; `None` off Linux or without os-release
    pub fn detect() -> Option<Self> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let content = std::fs::read_to_string("/etc/os-release").ok()?;
        Self::from_os_release(&content, debian_arch(std::env::consts::ARCH))
    }

    /// Parse os-release content. The release prefers VERSION_CODENAME
    /// over VERSION_ID, matching how distribution archives name releases.
    pub fn from_os_release(content: &str, arch: &str) -> Option<Self> {
        let mut id = None;
        let mut version_id = None;
        let mut codename = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "id" => id = Some(value),
                "version_id" => version_id = Some(value),
                "version_codename" => codename = Some(value),
                _ => {}
            }
        }

        Some(Self {
            os: id?,
            release: codename.or(version_id)?,
            arch: arch.to_string(),
        })
    }
}

/// Map a Rust target arch name to the Debian archive spelling
pub fn debian_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        other => other,
    }
}
