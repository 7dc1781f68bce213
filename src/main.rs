use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use remote_window::app::browse::{BrowseEngine, FilterOutcome};
use remote_window::app::mode::{Mode, ModeManager};
use remote_window::config::Config;
use remote_window::config_io::DirectoryContext;
use remote_window::event::EngineEvent;
use remote_window::model::pattern::PatternSpec;
use remote_window::services::file_watcher::{FileWatcher, WatchUpdateKind};
use remote_window::services::line_tool::{CommandLineTool, ExternalLineTool};
use remote_window::services::remote::{LocalRemoteBackend, RemoteFileService, RemotePath};
use remote_window::services::time_source::RealTimeSource;
use remote_window::services::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;

/// Windowed access to files too large to open
#[derive(Parser, Debug)]
#[command(name = "rwin")]
#[command(about = "Browse, filter, tail and watch large files without loading them", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Path to log file (default: data dir, see --show-paths)
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Log to stderr instead of a file
    #[arg(long, global = true)]
    log_stderr: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,

    /// Print the directories used by rwin and exit
    #[arg(long)]
    show_paths: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show size and modification time
    Stat { path: String },

    /// Print lines [start, end), 1-based inclusive start
    Lines {
        path: String,
        #[arg(long, default_value_t = 1)]
        start: usize,
        #[arg(long)]
        end: Option<usize>,
    },

    /// Print the lines matching a pattern
    Filter {
        path: String,
        pattern: String,
        #[command(flatten)]
        flags: PatternFlags,
    },

    /// Print every occurrence of a pattern with its position
    Search {
        path: String,
        pattern: String,
        #[command(flatten)]
        flags: PatternFlags,
    },

    /// Print lines as they are appended
    Tail { path: String },

    /// Report growth and rewrites detected by polling
    Watch { path: String },

    /// Decide between browse and edit mode and report the outcome
    Open { path: String },
}

#[derive(clap::Args, Debug)]
struct PatternFlags {
    /// Treat the pattern as a regular expression
    #[arg(short = 'E', long)]
    regex: bool,

    #[arg(short, long)]
    ignore_case: bool,

    /// Match whole words only
    #[arg(short, long)]
    word: bool,
}

impl PatternFlags {
    fn spec(&self, pattern: &str) -> PatternSpec {
        let spec = if self.regex {
            PatternSpec::regex(pattern)
        } else {
            PatternSpec::literal(pattern)
        };
        spec.case_sensitive(!self.ignore_case).whole_word(self.word)
    }
}

struct Session {
    config: Config,
    remote: Arc<dyn RemoteFileService>,
    tool: Arc<dyn ExternalLineTool>,
}

impl Session {
    fn new(config: Config) -> Self {
        let tool = CommandLineTool::for_host(config.timeouts.command());
        Self {
            config,
            remote: Arc::new(LocalRemoteBackend::new()),
            tool: Arc::new(tool),
        }
    }

    fn browse(&self, path: &str) -> BrowseEngine {
        let engine = BrowseEngine::new(RemotePath::local(path), self.tool.clone(), &self.config.browse);
        engine.set_encoding(&self.config.encoding);
        engine
    }
}

fn init_logging(args: &Args, dirs: &DirectoryContext) -> AnyhowResult<()> {
    if args.log_stderr {
        tracing_setup::init_stderr();
        return Ok(());
    }
    let log_file = match &args.log_file {
        Some(path) => path.clone(),
        None => dirs.log_path(),
    };
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    tracing_setup::init_global(&log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let args = Args::parse();
    let dirs = DirectoryContext::from_system()?;

    if args.show_paths {
        println!("config: {}", dirs.config_path().display());
        println!("log:    {}", dirs.log_path().display());
        return Ok(());
    }

    init_logging(&args, &dirs)?;
    tracing::info!("rwin starting");

    let working_dir = std::env::current_dir().unwrap_or_default();
    let config = Config::resolve(args.config.as_deref(), &working_dir, &dirs)?;

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let Some(command) = args.command else {
        anyhow::bail!("No command given; see --help");
    };
    run(command, Session::new(config)).await
}

async fn run(command: Command, session: Session) -> AnyhowResult<()> {
    match command {
        Command::Stat { path } => {
            let stat = session.remote.stat(&RemotePath::local(&path)).await?;
            let lines = session.browse(&path).total_line_count().await?;
            println!("size:     {} bytes", stat.size);
            println!("lines:    {}", lines);
            if let Some(modified) = stat.modified {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                println!("modified: {}", modified.to_rfc3339());
            }
        }
        Command::Lines { path, start, end } => {
            let engine = session.browse(&path);
            let first = start.saturating_sub(1);
            let end = match end {
                Some(end) => end,
                None => engine.total_line_count().await?,
            };
            for (offset, line) in engine.load_range(first, end).await?.iter().enumerate() {
                println!("{:>8}  {}", first + offset + 1, line);
            }
        }
        Command::Filter {
            path,
            pattern,
            flags,
        } => {
            let engine = session.browse(&path);
            if let FilterOutcome::Applied(result) = engine.apply_filter_spec(flags.spec(&pattern)).await? {
                for line in &result.lines {
                    println!("{:>8}  {}", line.line + 1, line.text);
                }
                eprintln!("{} of {} lines match", result.matched_count, result.total_count);
            }
        }
        Command::Search {
            path,
            pattern,
            flags,
        } => {
            let engine = session.browse(&path);
            let matches = engine.search(flags.spec(&pattern)).await?;
            for m in &matches {
                println!("{}:{}:{}", m.line + 1, m.column + 1, m.text);
            }
            eprintln!("{} matches", matches.len());
        }
        Command::Tail { path } => {
            let engine = session.browse(&path);
            let mut events = engine.subscribe();
            engine.total_line_count().await?;
            engine.start_tail().await?;
            while let Some(event) = events.events.recv().await {
                if let EngineEvent::LinesAppended { first_line, count } = event {
                    for line in engine.load_range(first_line, first_line + count).await? {
                        println!("{}", line);
                    }
                }
            }
        }
        Command::Watch { path } => {
            let watcher = FileWatcher::new(
                session.remote.clone(),
                session.config.watch_config(),
                RealTimeSource::shared(),
            );
            let mut events = watcher.subscribe();
            watcher.start_watch(&RemotePath::local(&path)).await?;
            while let Some(event) = events.events.recv().await {
                match event {
                    EngineEvent::WatchUpdate(update) => match update.kind {
                        WatchUpdateKind::Incremental {
                            lines,
                            start_offset,
                            end_offset,
                        } => {
                            println!("+{} lines (bytes {}..{})", lines.len(), start_offset, end_offset);
                            for line in lines {
                                println!("  {}", line);
                            }
                        }
                        WatchUpdateKind::FullReload { reason } => {
                            println!("reload: {}", reason);
                        }
                    },
                    EngineEvent::WatchStopped { reason, .. } => {
                        anyhow::bail!("Watch stopped: {}", reason);
                    }
                    _ => {}
                }
            }
        }
        Command::Open { path } => {
            let manager = ModeManager::new(
                RemotePath::local(&path),
                session.remote.clone(),
                session.tool.clone(),
                &session.config,
            );
            match manager.open().await? {
                Mode::Edit => {
                    let bytes = manager.edit().content().map_or(0, |c| c.len());
                    println!("edit mode: {} bytes loaded", bytes);
                }
                Mode::Browse => {
                    let lines = manager.browse().total_line_count().await?;
                    println!("browse mode: {} lines", lines);
                }
            }
        }
    }
    Ok(())
}
