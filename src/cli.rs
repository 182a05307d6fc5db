use crate::config::loader::ResolverConfig;
use crate::config::types::{DeptraceError, TrialCommand};
use crate::exec::stream::RecordWriter;
use crate::exec::{ProcessTracer, TracerOptions};
use crate::index::{ArchiveMirror, ContentsIndex, PackageIndex};
use crate::kernel::signal::{CancelToken, SignalHandler};
use crate::observability::journal::Journal;
use crate::resolve::{EngineOptions, Resolution, ResolutionEngine};
use crate::safety::workspace::{self, RunWorkspace};
use crate::sandbox::DockerSandbox;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Unnamed run directories older than this are pruned at startup
const STALE_RUN_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./deptrace.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log every trial decision
    #[arg(long, global = true, conflicts_with = "quiet")]
    debug: bool,
    /// Only log errors
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Target platform overrides layered over the configuration file
#[derive(Args, Clone, Debug, Default)]
struct PlatformArgs {
    /// Operating system of the package archive (e.g. ubuntu)
    #[arg(long = "os")]
    os: Option<String>,
    /// Release of the operating system (e.g. noble)
    #[arg(long, short = 'r')]
    release: Option<String>,
    /// Architecture in archive spelling (e.g. amd64)
    #[arg(long)]
    arch: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the packages COMMAND needs to run
    Resolve {
        #[command(flatten)]
        platform: PlatformArgs,
        /// Number of solutions to report
        #[arg(long, short = 'n', conflicts_with = "all")]
        num_results: Option<usize>,
        /// Report every solution
        #[arg(long, short = 'a')]
        all: bool,
        /// Keep run artifacts in this directory
        #[arg(long, short = 'd')]
        log_dir: Option<PathBuf>,
        /// Overwrite an existing log directory
        #[arg(long, short = 'f')]
        force: bool,
        /// Rebuild the package index before resolving
        #[arg(long)]
        rebuild: bool,
        /// Build the index from this Contents listing instead of downloading it
        #[arg(long, value_name = "FILE")]
        contents: Option<PathBuf>,
        /// Sibling trials run at once
        #[arg(long, short = 'j')]
        parallelism: Option<usize>,
        /// Per-trial time limit in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Follow child processes while tracing
        #[arg(long)]
        follow_forks: bool,
        /// Read one command per line from FILE and resolve them in sequence
        #[arg(long, short = 'm', value_name = "FILE", conflicts_with = "command")]
        steps: Option<PathBuf>,
        /// Command and arguments to resolve
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List the packages that provide each PATH
    Search {
        #[command(flatten)]
        platform: PlatformArgs,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Trace COMMAND and write its file-access records (runs inside trials)
    Trace {
        /// Record stream destination
        #[arg(long)]
        output: PathBuf,
        /// Write the exit status as JSON here
        #[arg(long)]
        status: Option<PathBuf>,
        #[arg(long)]
        follow_forks: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Manage the cached package index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Build the index for a platform, downloading its Contents listing
    /// from the mirror unless one is given
    Rebuild {
        #[command(flatten)]
        platform: PlatformArgs,
        /// Local Contents listing (plain or .gz)
        #[arg(long, value_name = "FILE")]
        contents: Option<PathBuf>,
    },
    /// List the releases and architectures the mirror has listings for
    List,
}

fn init_logging(debug: bool, quiet: bool) {
    let default_level = if debug {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn load_config(path: Option<&Path>, platform: &PlatformArgs) -> Result<ResolverConfig> {
    let mut config = match path {
        Some(path) => ResolverConfig::load_from_file(path)?,
        None => ResolverConfig::load_default()?,
    };
    if let Some(os) = &platform.os {
        config.os = os.clone();
    }
    if let Some(release) = &platform.release {
        config.release = release.clone();
    }
    if let Some(arch) = &platform.arch {
        config.arch = arch.clone();
    }
    Ok(config)
}

/// Cached index for the configured platform, rebuilt when asked to or
/// when nothing is cached yet
fn load_index(
    config: &ResolverConfig,
    contents: Option<&Path>,
    rebuild: bool,
) -> Result<ContentsIndex> {
    let cache_dir = config.cache_dir();
    let key = config.index_key();

    if rebuild || !ContentsIndex::exists(&cache_dir, &key) {
        return rebuild_index(config, contents);
    }

    let index = ContentsIndex::load(&cache_dir, &key)?;
    if let Some(max_age) = config.index_max_age() {
        if index.is_stale(max_age) {
            log::warn!(
                "Package index for {} is {} day(s) old; consider `deptrace index rebuild`",
                key,
                index.age().as_secs() / 86_400
            );
        }
    }
    Ok(index)
}

/// Build and persist the index from `source`, or from the mirror's listing
/// when no source is given
fn rebuild_index(config: &ResolverConfig, source: Option<&Path>) -> Result<ContentsIndex> {
    let key = config.index_key();
    let cache_dir = config.cache_dir();
    let index = match source {
        Some(source) => {
            let mut index = ContentsIndex::new(key.clone());
            index.rebuild(&key, source).with_context(|| {
                format!("Failed to build the package index from {}", source.display())
            })?;
            index
        }
        None => ArchiveMirror::new(&config.mirror)?
            .fetch_index(&key, &cache_dir)
            .with_context(|| format!("Failed to download the package index for {}", key))?,
    };
    let path = index.save(&cache_dir)?;
    log::info!("Indexed {} paths for {} into {}", index.len(), key, path.display());
    Ok(index)
}

fn list_configurations(config: &ResolverConfig) -> Result<()> {
    let mirror = ArchiveMirror::new(&config.mirror)?;
    let keys = mirror
        .configurations(&config.index_key())
        .with_context(|| format!("Failed to list {}", config.mirror.dists_url))?;
    let cache_dir = config.cache_dir();
    for key in &keys {
        let cached = if ContentsIndex::exists(&cache_dir, key) {
            "  (cached)"
        } else {
            ""
        };
        println!(
            "--os {} --release {} --arch {}{}",
            key.os, key.release, key.arch, cached
        );
    }
    if keys.is_empty() {
        log::warn!("No Contents listings found under {}", config.mirror.dists_url);
    }
    Ok(())
}

/// Split one command line on whitespace, honouring single and double quotes
/// and backslash escapes
pub fn split_command_line(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                Some(escaped) => {
                    current.push(escaped);
                    in_word = true;
                }
                None => return Err("trailing backslash".to_string()),
            },
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Commands of a steps file: one per line, blank lines and `#` comments skipped
pub fn parse_steps(content: &str) -> std::result::Result<Vec<TrialCommand>, String> {
    let mut steps = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let argv = split_command_line(line).map_err(|e| format!("line {}: {}", n + 1, e))?;
        if let Some(command) = TrialCommand::from_argv(&argv) {
            steps.push(command);
        }
    }
    Ok(steps)
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.quiet);

    if !cfg!(target_os = "linux") {
        eprintln!("Error: deptrace requires Linux (ptrace) to trace commands");
        std::process::exit(1);
    }

    if let Err(e) = SignalHandler::init() {
        log::warn!("{}", e);
    }

    match cli.command {
        Commands::Trace {
            output,
            status,
            follow_forks,
            command,
        } => {
            let code = trace_command(&output, status.as_deref(), follow_forks, &command)?;
            std::process::exit(code);
        }
        Commands::Index {
            action: IndexAction::Rebuild { platform, contents },
        } => {
            let config = load_config(cli.config.as_deref(), &platform)?;
            rebuild_index(&config, contents.as_deref())?;
            Ok(())
        }
        Commands::Index {
            action: IndexAction::List,
        } => {
            let config = load_config(cli.config.as_deref(), &PlatformArgs::default())?;
            list_configurations(&config)
        }
        Commands::Search { platform, paths } => {
            let config = load_config(cli.config.as_deref(), &platform)?;
            let index = load_index(&config, None, false)?;
            let mut all_found = true;
            for path in &paths {
                let providers = index.lookup(path)?;
                if providers.is_empty() {
                    log::info!("No packages found that provide {}", path);
                    all_found = false;
                } else {
                    println!("{}: {}", path, providers.join(", "));
                }
            }
            if !all_found {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Resolve {
            platform,
            num_results,
            all,
            log_dir,
            force,
            rebuild,
            contents,
            parallelism,
            timeout,
            follow_forks,
            steps,
            command,
        } => {
            let mut config = load_config(cli.config.as_deref(), &platform)?;
            if let Some(n) = num_results {
                config.max_solutions = n;
            }
            if all {
                config.max_solutions = 0;
            }
            if let Some(parallelism) = parallelism {
                config.parallelism = parallelism;
            }
            if timeout.is_some() {
                config.trial_timeout_secs = timeout;
            }
            config.follow_forks |= follow_forks;
            config.validate()?;

            let commands = match &steps {
                Some(path) => {
                    let content = std::fs::read_to_string(path)
                        .with_context(|| format!("Could not open steps file {}", path.display()))?;
                    parse_steps(&content).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?
                }
                None => TrialCommand::from_argv(&command).into_iter().collect(),
            };

            let index = load_index(&config, contents.as_deref(), rebuild)?;
            if commands.is_empty() {
                if rebuild {
                    return Ok(());
                }
                anyhow::bail!("Nothing to resolve; pass a command after `resolve`");
            }

            let code = resolve_commands(&config, &index, &commands, log_dir.as_deref(), force)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

fn trace_command(
    output: &Path,
    status: Option<&Path>,
    follow_forks: bool,
    argv: &[String],
) -> Result<i32> {
    let command = TrialCommand::from_argv(argv).context("missing command to trace")?;
    let tracer = ProcessTracer::new(TracerOptions { follow_forks });
    let mut writer = RecordWriter::create(output)?;

    let exit = tracer.trace_with_sink(&command, &CancelToken::from_signals(), &mut |record| {
        writer.write(&record)
    })?;
    log::debug!("{} exited with {} after {} records", command, exit, writer.written());

    if let Some(status) = status {
        std::fs::write(status, serde_json::to_vec(&exit)?)
            .with_context(|| format!("Failed to write exit status to {}", status.display()))?;
    }
    Ok(exit.as_shell_code())
}

fn resolve_commands(
    config: &ResolverConfig,
    index: &ContentsIndex,
    commands: &[TrialCommand],
    log_dir: Option<&Path>,
    force: bool,
) -> Result<i32> {
    let runs_dir = std::env::temp_dir().join("deptrace-runs");
    if log_dir.is_none() {
        match workspace::prune_stale_runs(&runs_dir, STALE_RUN_AGE) {
            Ok(0) => {}
            Ok(n) => log::debug!("Pruned {} stale run directories", n),
            Err(e) => log::warn!("Failed to prune old run directories: {}", e),
        }
    }

    let run = RunWorkspace::create(log_dir, &runs_dir, force)?;
    let journal = Journal::create(&run.journal_path(), run.run_id())?;
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    let sandbox = DockerSandbox::new(config, cwd.clone(), run.trials_dir())?;
    if let Err(e) = sandbox.check_available() {
        log::error!("{}\nIs Docker installed and running?", e);
        report_kept(run.finish(false));
        return Ok(1);
    }

    let engine = ResolutionEngine::new(&sandbox, index, EngineOptions::from_config(config, cwd))
        .with_cancel(CancelToken::from_signals())
        .with_journal(&journal);

    let resolution = match engine.resolve_steps(commands, config.max_solutions) {
        Ok(resolution) => resolution,
        Err(e) => {
            match &e {
                DeptraceError::IndexLookup { .. } => log::error!(
                    "{}\nThe package index may be corrupt; rebuild it with `--rebuild`",
                    e
                ),
                _ => log::error!("{}", e),
            }
            report_kept(run.finish(false));
            return Ok(1);
        }
    };

    let stats = engine.stats();
    log::debug!(
        "{} trial(s), {} install(s), {} reused, {} aborted, {} skipped",
        stats.trials,
        stats.installs,
        stats.reused,
        stats.aborted,
        stats.skipped_tried + stats.skipped_superset
    );

    match resolution {
        Resolution::Solved(solutions) => {
            for solution in &solutions {
                if solution.is_empty() {
                    log::info!("The command ran successfully without additional packages");
                } else {
                    log::info!(
                        "Satisfying dependencies: {}\nInstall with: {}",
                        solution,
                        config.package_manager.install_line(solution.packages())
                    );
                }
                println!("{}", solution.packages().join(" "));
            }
            if let Err(e) = run.write_solutions(&solutions) {
                log::warn!("Failed to record solutions: {}", e);
            }
            run.finish(true);
            Ok(0)
        }
        Resolution::Exhausted(partial) => {
            if partial.interrupted {
                log::error!("Interrupted before a solution was found");
            } else {
                log::error!("Could not find a package set that satisfies the command");
            }
            if !partial.best_partial.is_empty() || !partial.unresolved_paths.is_empty() {
                match run.write_sbom(&partial) {
                    Ok(path) => eprintln!(
                        "Most promising partial set: {}\n  saved to {}",
                        partial.best_partial,
                        path.display()
                    ),
                    Err(e) => log::warn!("Failed to write partial set: {}", e),
                }
            }
            for missing in &partial.unresolved_paths {
                eprintln!("  unresolved: {}", missing);
            }
            report_kept(run.finish(false));
            Ok(1)
        }
    }
}

fn report_kept(kept: Option<PathBuf>) {
    if let Some(dir) = kept {
        eprintln!("\nA log was saved to {}", dir.display());
    }
}
