use std::{
    cell::Cell,
    fs,
    io::{self, Write},
    path::PathBuf,
    rc::Rc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use okr::clock::{Clock, SystemClock};
use okr::config::{CONFIG_FILE_NAME, Config};
use okr::core::{NodeId, NodePatch, NodeType};
use okr::report::{self, DeadlineStatus};
use okr::storage::{self, JsonFileRepository, SnapshotRepository};
use okr::store::TreeStore;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "okr",
    about = "Personal OKR tree with progress roll-up and a work timer",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Configuration file (defaults to ./okr.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Working-state JSON file; overrides `storage.data_file`.
    #[arg(long, global = true)]
    data: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a node. Without --type it becomes the parent's natural child type.
    Add(AddArgs),

    /// Change a node's fields.
    Update(UpdateArgs),

    /// Remove a node and everything below it.
    Delete { id: NodeId },

    /// Reparent or reorder a node.
    Move(MoveArgs),

    /// Collapse or expand a node in the outline.
    Toggle { id: NodeId },

    /// Print the outline, or one node in detail.
    Show(ShowArgs),

    /// Work timer.
    #[command(subcommand)]
    Timer(TimerCommand),

    /// Record time worked without the timer.
    LogTime(LogTimeArgs),

    /// Write a versioned export document.
    Export {
        /// Destination file; stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Replace everything with the contents of an export (or working-state) file.
    Import { file: PathBuf },

    /// Deadline health of tasks.
    Health,

    /// End the session: stop any running timer without logging it.
    Close,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Parent node; the node becomes a root when omitted.
    #[arg(long)]
    parent: Option<NodeId>,
    /// goal, strategy, objective, key_result, initiative or task.
    #[arg(long = "type")]
    kind: Option<NodeType>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    progress: Option<u8>,
    /// Due date (YYYY-MM-DD), end of day UTC.
    #[arg(long)]
    deadline: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    id: NodeId,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, conflicts_with = "clear_description")]
    description: Option<String>,
    #[arg(long)]
    clear_description: bool,
    #[arg(long)]
    progress: Option<u8>,
    /// 1-5 stars; 0 clears the rating.
    #[arg(long)]
    rating: Option<u8>,
    /// Due date (YYYY-MM-DD), end of day UTC.
    #[arg(long, conflicts_with = "clear_deadline")]
    deadline: Option<NaiveDate>,
    #[arg(long)]
    clear_deadline: bool,
}

#[derive(Debug, Args)]
struct MoveArgs {
    id: NodeId,
    /// New parent; moves to the root level when omitted.
    #[arg(long)]
    parent: Option<NodeId>,
    /// Position among the new siblings; appends when omitted.
    #[arg(long)]
    index: Option<usize>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Node to describe; the whole outline when omitted.
    id: Option<NodeId>,
    /// Emit the working state as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum TimerCommand {
    /// Start timing a node, discarding any session running elsewhere.
    Start { id: NodeId },
    /// Stop the running timer without recording anything.
    Stop,
    /// Stop the running timer and record the session as a task.
    Log {
        /// What was done; becomes the task title.
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Throw the running session away.
    Abandon,
    /// Show the running timer.
    Status,
}

#[derive(Debug, Args)]
struct LogTimeArgs {
    id: NodeId,
    minutes: u64,
    #[arg(long, default_value = "")]
    note: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli)?;
    init_tracing(&settings.config.log.filter, cli.verbose);
    run(cli.command, &settings, &mut io::stdout().lock())
}

/// Respects RUST_LOG; otherwise the configured filter, or debug output with --verbose.
fn init_tracing(configured: &str, verbose: bool) {
    let fallback = if verbose { "okr=debug" } else { configured };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug)]
struct Settings {
    config: Config,
    data_file: PathBuf,
}

impl Settings {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        let config = Config::load(&config_path)?;
        let data_file = cli
            .data
            .clone()
            .unwrap_or_else(|| config.storage.data_file.clone());
        Ok(Self { config, data_file })
    }
}

fn run(command: Commands, settings: &Settings, out: &mut impl Write) -> Result<()> {
    let repo = JsonFileRepository::new(&settings.data_file);
    let state = repo.load()?;
    let mut store = TreeStore::from_state(state, settings.config.engine.clone(), SystemClock);

    let save_failed = Rc::new(Cell::new(false));
    let failed = save_failed.clone();
    let saver = repo.clone();
    store.subscribe(move |_, state| {
        if let Err(err) = saver.save(state) {
            error!("failed to save working state: {err:#}");
            failed.set(true);
        }
    });

    execute(command, &mut store, out)?;

    if save_failed.get() {
        anyhow::bail!("changes could not be saved to {}", repo.path().display());
    }
    Ok(())
}

fn execute(command: Commands, store: &mut TreeStore, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Add(args) => {
            let kind = args.kind.unwrap_or_else(|| {
                args.parent
                    .as_ref()
                    .and_then(|p| store.node(p))
                    .map(|p| p.kind.child_type())
                    .unwrap_or(NodeType::Goal)
            });
            let mut patch = NodePatch::default().with_title(args.title.unwrap_or_default());
            if let Some(description) = args.description {
                patch = patch.with_description(Some(description));
            }
            if let Some(progress) = args.progress {
                patch = patch.with_progress(progress);
            }
            if let Some(date) = args.deadline {
                patch = patch.with_deadline(Some(end_of_day(date)?));
            }
            let id = store.add_node(args.parent.as_ref(), kind, patch);
            writeln!(out, "{id}")?;
        }
        Commands::Update(args) => {
            let id = args.id.clone();
            require(store, &id)?;
            let patch = update_patch(args)?;
            if patch.is_empty() {
                anyhow::bail!("nothing to update for {id}");
            }
            store.update_node(&id, patch);
        }
        Commands::Delete { id } => {
            require(store, &id)?;
            store.delete_node(&id);
        }
        Commands::Move(args) => {
            require(store, &args.id)?;
            store.move_node(
                &args.id,
                args.parent.as_ref(),
                args.index.unwrap_or(usize::MAX),
            );
        }
        Commands::Toggle { id } => {
            require(store, &id)?;
            store.toggle_expand(&id);
        }
        Commands::Show(args) => show(store, args, out)?,
        Commands::Timer(command) => timer(store, command, out)?,
        Commands::LogTime(args) => {
            let entry = store
                .log_manual_time(&args.id, args.minutes, &args.note)
                .with_context(|| format!("no node with id {}", args.id))?;
            writeln!(
                out,
                "{entry}\t{} logged",
                report::format_minutes(args.minutes)
            )?;
        }
        Commands::Export { output } => {
            let json = serde_json::to_string_pretty(&store.export())?;
            match output {
                Some(path) => {
                    storage::write_atomic(&path, json.as_bytes())?;
                    info!(path = %path.display(), "exported");
                }
                None => writeln!(out, "{json}")?,
            }
        }
        Commands::Import { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let state = store
                .import_str(&text)
                .with_context(|| format!("importing {}", file.display()))?;
            writeln!(out, "imported {} nodes", state.nodes.len())?;
        }
        Commands::Health => health(store, out)?,
        Commands::Close => {
            store.shutdown();
        }
    }
    Ok(())
}

fn require(store: &TreeStore, id: &NodeId) -> Result<()> {
    match store.node(id) {
        Some(_) => Ok(()),
        None => anyhow::bail!("no node with id {id}"),
    }
}

fn update_patch(args: UpdateArgs) -> Result<NodePatch> {
    let mut patch = NodePatch::default();
    if let Some(title) = args.title {
        patch = patch.with_title(title);
    }
    if args.clear_description {
        patch = patch.with_description(None);
    } else if let Some(description) = args.description {
        patch = patch.with_description(Some(description));
    }
    if let Some(progress) = args.progress {
        patch = patch.with_progress(progress);
    }
    if let Some(rating) = args.rating {
        patch = patch.with_rating(rating);
    }
    if args.clear_deadline {
        patch = patch.with_deadline(None);
    } else if let Some(date) = args.deadline {
        patch = patch.with_deadline(Some(end_of_day(date)?));
    }
    Ok(patch)
}

fn end_of_day(date: NaiveDate) -> Result<DateTime<Utc>> {
    let naive = date
        .and_hms_milli_opt(23, 59, 59, 999)
        .with_context(|| format!("invalid deadline {date}"))?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn show(store: &TreeStore, args: ShowArgs, out: &mut impl Write) -> Result<()> {
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(store.snapshot())?)?;
        return Ok(());
    }
    let Some(id) = args.id else {
        if store.snapshot().is_empty() {
            writeln!(out, "(empty)")?;
        } else {
            write!(out, "{}", report::render_tree(store.snapshot()))?;
        }
        return Ok(());
    };

    let node = store
        .node(&id)
        .with_context(|| format!("no node with id {id}"))?;
    let path: Vec<&str> = store
        .ancestors(&id)
        .iter()
        .map(|n| n.title.as_str())
        .collect();
    if !path.is_empty() {
        writeln!(out, "{}", path.join(" / "))?;
    }
    writeln!(out, "{} [{}]", node.title, node.kind.label())?;
    if let Some(description) = &node.description {
        writeln!(out, "  {description}")?;
    }
    writeln!(out, "  progress: {}%", node.progress)?;
    if node.kind == NodeType::KeyResult {
        writeln!(out, "  rating:   {}/5", node.rating)?;
    }
    if node.kind.tracks_time() {
        writeln!(
            out,
            "  time:     {} (subtree {})",
            report::format_minutes(node.time_spent),
            report::format_minutes(store.total_time(&id))
        )?;
    }
    if let Some(deadline) = node.deadline {
        let now = SystemClock.now();
        let health = report::deadline_status(node, now);
        writeln!(
            out,
            "  deadline: {} ({}d left, {}, health {})",
            deadline.format("%Y-%m-%d"),
            report::days_remaining(deadline, now),
            health.status.label(),
            health.health
        )?;
    }
    if let Some(minutes) = store.elapsed_minutes(&id) {
        writeln!(out, "  running:  {}", report::format_minutes(minutes))?;
    }
    Ok(())
}

fn timer(store: &mut TreeStore, command: TimerCommand, out: &mut impl Write) -> Result<()> {
    let active = store.active_timer().map(|n| n.id.clone());
    match command {
        TimerCommand::Start { id } => {
            require(store, &id)?;
            store.start_timer(&id);
            writeln!(out, "timing {id}")?;
        }
        TimerCommand::Stop => {
            let id = active.context("no timer is running")?;
            store.stop_timer(&id);
        }
        TimerCommand::Log { summary } => {
            let id = active.context("no timer is running")?;
            let entry = store
                .log_session(&id, &summary)
                .context("no timer is running")?;
            let minutes = store.node(&entry).map(|n| n.time_spent).unwrap_or_default();
            writeln!(out, "{entry}\t{} logged", report::format_minutes(minutes))?;
        }
        TimerCommand::Abandon => {
            let id = active.context("no timer is running")?;
            store.abandon_session(&id);
        }
        TimerCommand::Status => match store.active_timer() {
            Some(node) => {
                let started = node.timer_started_at.unwrap_or_else(|| SystemClock.now());
                let seconds = (SystemClock.now() - started).num_seconds().max(0) as u64;
                writeln!(
                    out,
                    "{}\t{}\t{}",
                    node.id,
                    node.title,
                    report::format_elapsed(seconds)
                )?;
            }
            None => writeln!(out, "no timer is running")?,
        },
    }
    Ok(())
}

fn health(store: &TreeStore, out: &mut impl Write) -> Result<()> {
    let now = SystemClock.now();
    let state = store.snapshot();
    for node in state.nodes.values() {
        if node.kind != NodeType::Task || node.deadline.is_none() {
            continue;
        }
        let health = report::deadline_status(node, now);
        if health.status != DeadlineStatus::Completed {
            writeln!(
                out,
                "{:<10} {:>3}  {}",
                health.status.label(),
                health.health,
                node.title
            )?;
        }
    }
    let summary = report::deadline_summary(state, now);
    writeln!(
        out,
        "{} with deadline: {} completed, {} on track, {} at risk, {} overdue",
        summary.total_with_deadline,
        summary.completed,
        summary.on_track,
        summary.at_risk,
        summary.overdue
    )?;
    Ok(())
}
