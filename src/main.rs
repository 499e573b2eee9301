use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use dirhook::watcher::{ChangeKind, FileEvent, FileWatcher, Handler};
use dirhook::{Settings, logging};

#[derive(Parser)]
#[command(name = "dirhook", version)]
#[command(about = "Print debounced file changes under one or more directories")]
struct Cli {
    /// Directories to watch
    #[arg(default_value = ".")]
    paths: Vec<PathBuf>,

    /// Glob matched against file names or root-relative paths
    #[arg(short, long)]
    pattern: Option<String>,

    /// Change kinds to report (default: all)
    #[arg(short, long, value_enum, value_delimiter = ',')]
    events: Vec<EventArg>,

    /// Report existing files as created on startup
    #[arg(long)]
    existing: bool,

    /// Debounce window in seconds (overrides config)
    #[arg(short, long)]
    debounce: Option<f64>,

    /// Worker threads for handlers (overrides config)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Only watch the top level of each directory
    #[arg(long)]
    no_recursive: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "DIRHOOK_JSON_LOGS")]
    json_logs: bool,

    /// Settings file (default: nearest .dirhook/settings.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    Created,
    Modified,
    Deleted,
}

impl From<EventArg> for ChangeKind {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Created => ChangeKind::Created,
            EventArg::Modified => ChangeKind::Modified,
            EventArg::Deleted => ChangeKind::Deleted,
        }
    }
}

impl Cli {
    /// Apply command-line overrides on top of the layered settings.
    fn apply(&self, settings: &mut Settings) {
        if let Some(debounce) = self.debounce {
            settings.watch.debounce_secs = debounce;
        }
        if let Some(workers) = self.max_workers {
            settings.watch.max_workers = workers;
        }
        if self.no_recursive {
            settings.watch.recursive = false;
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }

    fn kinds(&self) -> Vec<ChangeKind> {
        if self.events.is_empty() {
            ChangeKind::ALL.to_vec()
        } else {
            self.events.iter().copied().map(ChangeKind::from).collect()
        }
    }
}

fn print_event(event: &FileEvent) -> anyhow::Result<()> {
    println!("{} {}", event.kind, event.path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
    cli.apply(&mut settings);

    logging::init_with_config(&settings.logging);

    let watcher = FileWatcher::new(settings.watch.clone());
    for path in &cli.paths {
        if !path.is_dir() {
            bail!("not a directory: {}", path.display());
        }

        let mut builder = Handler::builder(path.display().to_string(), path)
            .events(cli.kinds())
            .process_existing(cli.existing);
        if let Some(pattern) = &cli.pattern {
            builder = builder.pattern(pattern.clone());
        }

        let handler = builder
            .blocking(print_event)
            .with_context(|| format!("cannot watch {}", path.display()))?;
        watcher.add_handler(handler);
    }

    let stop = CancellationToken::new();
    let token = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            dirhook::log_event!("cli", "interrupt received, stopping");
            token.cancel();
        }
    });

    let watcher = Arc::new(watcher);
    let stats = tokio::task::spawn_blocking(move || watcher.run_notify(&stop))
        .await
        .context("watcher thread failed")??;

    eprintln!(
        "Stopped: {} settled changes, {} handler calls, {} failures",
        stats.settled_events, stats.invocations, stats.failures
    );
    Ok(())
}
