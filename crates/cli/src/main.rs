use std::{
    cell::RefCell,
    collections::BTreeMap,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use conversation_store::{ConversationStore, SharedStore, lock, shared};
use core_model::{GatewayFrame, Message};
use history::{HistoryLoader, LoadOutcome, LoadPhase};
use reconcile::{FrameOutcome, LiveReconciler};
use replay::{ReplayDriver, ReplaySequencer, ReplaySnapshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod source;
mod ui;

use config::Config;
use source::FileHistorySource;

#[derive(Parser)]
#[command(name = "threadline")]
#[command(about = "Reconcile and replay agent conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Config file; defaults to <config_dir>/threadline/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load history, apply live events and print the resulting timeline.
    Reconcile(ReconcileArgs),
    /// Replay a finished conversation tick by tick.
    Replay(ReplayArgs),
}

#[derive(Args)]
struct ReconcileArgs {
    /// History page: an array of records or {"messages": [...]}.
    #[arg(long)]
    history: PathBuf,
    /// Gateway frames, one JSON object per line.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "main")]
    session: String,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Fetch exactly this many records instead of probing the total.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct ReplayArgs {
    /// History page or a structured replay snapshot.
    #[arg(long)]
    history: PathBuf,
    /// Apply this many ticks without waiting and print the frame.
    #[arg(long)]
    ticks: Option<u64>,
    #[arg(long, default_value = "main")]
    session: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = Config::load(cli.config.as_deref())?;
    let t = Instant::now();

    match cli.command {
        Commands::Reconcile(args) => {
            let store = shared(ConversationStore::new());
            let outcome =
                load_history(&config, &store, &args.session, &args.history, args.limit).await?;
            info!(?outcome, session = %args.session, "history ready");
            if let Some(events) = &args.events {
                apply_events(&store, events)?;
            }
            let store = lock(&store);
            match args.format {
                OutputFormat::Text => {
                    let use_color = ui::color_enabled();
                    for session in store.sessions() {
                        print!("{}", ui::render_timeline(session, store.messages(session), use_color));
                    }
                }
                OutputFormat::Json => {
                    let timeline: BTreeMap<&str, &[Message]> = store
                        .sessions()
                        .into_iter()
                        .map(|session| (session, store.messages(session)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&timeline)?);
                }
            }
            info!(elapsed = ?t.elapsed(), "reconcile done");
        }
        Commands::Replay(args) => {
            let replay_config = config.replay.to_replay_config()?;
            let snapshot = Arc::new(replay_snapshot(&config, &args).await?);
            let use_color = ui::color_enabled();
            info!(messages = snapshot.messages.len(), "replaying");

            if let Some(ticks) = args.ticks {
                let mut sequencer = ReplaySequencer::new(replay_config);
                sequencer.start(snapshot);
                for _ in 0..ticks {
                    if !sequencer.tick() {
                        break;
                    }
                }
                print!("{}", ui::render_replay_frame(&sequencer, use_color));
            } else {
                let mut driver = ReplayDriver::new(replay_config);
                driver.start(snapshot);
                if use_color {
                    let mut redraw = tokio::time::interval(replay_config.tick);
                    let mut stdout = std::io::stdout();
                    while driver.is_active() {
                        redraw.tick().await;
                        let frame = ui::render_replay_frame(&driver.sequencer(), use_color);
                        write!(stdout, "\x1b[2J\x1b[H{frame}")?;
                        stdout.flush()?;
                    }
                }
                driver.finished().await;
                let frame = ui::render_replay_frame(&driver.sequencer(), use_color);
                if use_color {
                    print!("\x1b[2J\x1b[H");
                }
                print!("{frame}");
            }
            info!(elapsed = ?t.elapsed(), "replay done");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn load_history(
    config: &Config,
    store: &SharedStore,
    session: &str,
    path: &Path,
    limit: Option<usize>,
) -> anyhow::Result<LoadOutcome> {
    let source = FileHistorySource::open(session, path)?;
    let loader = HistoryLoader::new(source, config.history);
    let started = Instant::now();
    let last = RefCell::new(started);
    let log_phase = |phase: LoadPhase| {
        let now = Instant::now();
        let delta = now.duration_since(*last.borrow());
        *last.borrow_mut() = now;
        match phase {
            LoadPhase::Probing => {
                info!(session, elapsed = ?started.elapsed(), ?delta, "probing history size")
            }
            LoadPhase::Fetching { limit } => {
                info!(session, limit, elapsed = ?started.elapsed(), ?delta, "fetching history")
            }
            LoadPhase::Normalizing { records } => {
                info!(session, records, elapsed = ?started.elapsed(), ?delta, "normalizing records")
            }
            LoadPhase::Done { messages } => {
                info!(session, messages, elapsed = ?started.elapsed(), ?delta, "history loaded")
            }
        }
    };
    let outcome = loader
        .load(store, session, false, limit, log_phase)
        .await
        .with_context(|| format!("loading history from {}", path.display()))?;
    Ok(outcome)
}

fn apply_events(store: &SharedStore, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut reconciler = LiveReconciler::default();
    let (mut applied, mut skipped) = (0usize, 0usize);
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let frame: GatewayFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping unreadable frame");
                skipped += 1;
                continue;
            }
        };
        match reconciler.apply_frame(store, &frame) {
            FrameOutcome::Malformed | FrameOutcome::Ignored => skipped += 1,
            FrameOutcome::Chat(_) | FrameOutcome::Tool(_) => applied += 1,
        }
    }
    info!(applied, skipped, "events applied");
    Ok(())
}

/// A structured snapshot when the file carries sections, otherwise the
/// conversation loaded from a history page.
async fn replay_snapshot(config: &Config, args: &ReplayArgs) -> anyhow::Result<ReplaySnapshot> {
    let value = source::read_json(&args.history)?;
    if is_structured_snapshot(&value) {
        return serde_json::from_value(value)
            .with_context(|| format!("invalid replay snapshot in {}", args.history.display()));
    }
    let store = shared(ConversationStore::new());
    let source = FileHistorySource::from_value(args.session.as_str(), value)?;
    HistoryLoader::new(source, config.history)
        .load(&store, &args.session, false, None, |_| {})
        .await?;
    let messages = lock(&store).snapshot(&args.session);
    Ok(ReplaySnapshot::from_messages(&messages))
}

fn is_structured_snapshot(value: &serde_json::Value) -> bool {
    value
        .get("messages")
        .and_then(|m| m.as_array())
        .is_some_and(|messages| messages.iter().any(|m| m.get("sections").is_some()))
}
