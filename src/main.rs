//! fitsync - Offline-first workout log with local profiles and cloud sync

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing_subscriber::EnvFilter;

use fitsync::model::{ExerciseSpec, HealthEntry, RoutineExercise, SessionPatch, Settings, WeightUnit, new_id};
use fitsync::session::{SessionEvent, SessionMode, SystemClock};
use fitsync::stats::{Analytics, latest_bodyweight_kg};
use fitsync::sync::{FileRemoteStore, FirstSyncChoice, SyncStatus, TracingSink};
use fitsync::{App, ImportMode, ProfileStore, SignInOutcome, SqliteMap};

#[derive(Parser)]
#[command(name = "fitsync")]
#[command(author, version, about = "Offline-first workout log")]
struct Cli {
    /// Path of the local database
    #[arg(long, env = "FITSYNC_DB", default_value = "fitsync.db", global = true)]
    db: String,

    /// Local profile to sign in as
    #[arg(short, long, env = "FITSYNC_USER", global = true)]
    user: Option<String>,

    #[arg(short, long, env = "FITSYNC_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Directory holding remote documents
    #[arg(long, env = "FITSYNC_REMOTE_DIR", global = true)]
    remote_dir: Option<PathBuf>,

    /// Cloud account; routes all changes to the remote document
    #[arg(long, env = "FITSYNC_ACCOUNT", global = true)]
    account: Option<String>,

    /// What to do with local data on first cloud sign-in
    #[arg(long, value_enum, global = true)]
    first_sync: Option<FirstSync>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum FirstSync {
    Merge,
    Overwrite,
}

impl From<FirstSync> for FirstSyncChoice {
    fn from(choice: FirstSync) -> Self {
        match choice {
            FirstSync::Merge => FirstSyncChoice::Merge,
            FirstSync::Overwrite => FirstSyncChoice::Overwrite,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a local profile (uses --user and --password)
    Register,

    /// Reset a password with a recovery code or a saved recovery kit
    ResetPassword {
        new_password: String,

        #[arg(long, conflicts_with = "kit")]
        code: Option<String>,

        /// Recovery kit file as printed by `register`
        #[arg(long)]
        kit: Option<PathBuf>,
    },

    /// Log one exercise as a finished session
    Log {
        /// Exercise name (defaults to the configured exercise)
        exercise: Option<String>,

        #[arg(short, long)]
        sets: Option<u32>,

        #[arg(short, long)]
        reps: Option<u32>,

        #[arg(short, long)]
        weight: Option<f64>,

        /// kg or lb
        #[arg(long)]
        unit: Option<WeightUnit>,

        #[arg(short, long)]
        notes: Option<String>,
    },

    /// List training history
    List {
        /// Number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Delete a logged session
    Delete { id: String },

    /// Show training statistics
    Stats {
        /// Filter by exercise name
        exercise: Option<String>,
    },

    /// Body measurements
    Health {
        #[command(subcommand)]
        action: HealthAction,
    },

    /// Workout templates
    Routine {
        #[command(subcommand)]
        action: RoutineAction,
    },

    /// Change profile defaults
    Settings {
        #[arg(long)]
        exercise: Option<String>,

        #[arg(long)]
        sets: Option<u32>,

        #[arg(long)]
        reps: Option<u32>,

        #[arg(long)]
        weight: Option<f64>,

        #[arg(long)]
        unit: Option<WeightUnit>,

        /// Inactivity timeout in minutes
        #[arg(long)]
        timeout: Option<u32>,
    },

    /// Write the dataset as JSON
    Export {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load a JSON backup
    Import {
        path: PathBuf,

        /// Merge into current data instead of replacing it
        #[arg(long)]
        merge: bool,
    },

    /// Reconcile with the remote document now
    Sync,

    /// Interactive session with inactivity auto-commit
    Shell,

    /// Delete the signed-in profile and its data
    DeleteProfile,

    /// Erase every profile and cached dataset
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum HealthAction {
    /// Record a measurement
    Add {
        #[arg(long)]
        weight: Option<f64>,

        #[arg(long)]
        unit: Option<WeightUnit>,

        #[arg(long)]
        body_fat: Option<f64>,

        #[arg(long)]
        sleep: Option<f64>,

        #[arg(long)]
        water: Option<f64>,

        #[arg(long)]
        heart_rate: Option<u32>,
    },

    List {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    Delete { id: String },
}

#[derive(Subcommand)]
enum RoutineAction {
    /// Create a routine, e.g. `routine add Legs -e Squat:5x5 -e Lunge:3x10`
    Add {
        name: String,

        #[arg(short, long = "exercise", value_parser = parse_routine_exercise, required = true)]
        exercises: Vec<RoutineExercise>,
    },

    List,

    Delete { id: String },
}

fn parse_sets_reps(s: &str) -> Option<(u32, u32)> {
    let (sets, reps) = s.split_once(['x', 'X'])?;
    Some((sets.trim().parse().ok()?, reps.trim().parse().ok()?))
}

fn parse_routine_exercise(s: &str) -> Result<RoutineExercise, String> {
    let (name, load) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected NAME:SETSxREPS, got '{}'", s))?;
    let (sets, reps) = parse_sets_reps(load).ok_or_else(|| format!("bad sets/reps '{}'", load))?;
    Ok(RoutineExercise {
        name: name.trim().to_string(),
        sets,
        reps,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();
    let command = cli.command.take().unwrap_or(Commands::List { limit: 10 });

    let map = SqliteMap::open(&cli.db).with_context(|| format!("opening {}", cli.db))?;
    let profiles = ProfileStore::open(Box::new(map))?;
    let (tx, events) = unbounded_channel();
    let mut app = App::new(profiles, tx, Arc::new(SystemClock));

    match command {
        Commands::Register => {
            let (Some(user), Some(password)) = (&cli.user, &cli.password) else {
                bail!("register needs --user and --password");
            };
            let kit = app.register(user, password)?;
            println!("Profile created. Keep this recovery kit somewhere safe:");
            println!();
            println!("{}", kit);
        }

        Commands::ResetPassword { new_password, code, kit } => {
            match (code, kit) {
                (_, Some(path)) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    app.reset_password_with_kit(&text, &new_password)?;
                }
                (Some(code), None) => {
                    let user = cli.user.as_deref().context("--user is required with --code")?;
                    app.reset_password(user, &code, &new_password)?;
                }
                (None, None) => bail!("pass --code or --kit"),
            }
            println!("Password updated");
        }

        Commands::Reset { yes } => {
            if !yes {
                bail!("This erases every profile. Re-run with --yes to confirm");
            }
            app.reset_app()?;
            println!("All data erased");
        }

        command => {
            authenticate(&mut app, &cli).await?;
            run_command(&mut app, command, events).await?;
        }
    }

    finish_sync(&mut app).await;
    Ok(())
}

async fn authenticate(app: &mut App, cli: &Cli) -> Result<()> {
    if let Some(user) = &cli.user {
        let password = cli
            .password
            .as_deref()
            .context("--password (or FITSYNC_PASSWORD) is required with --user")?;
        app.login(user, password)?;
    }

    if let Some(account) = &cli.account {
        let dir = cli.remote_dir.as_ref().context("--remote-dir is required with --account")?;
        let remote = Arc::new(FileRemoteStore::new(dir, account));
        let outcome = app
            .sign_in_cloud(account, remote, Arc::new(TracingSink), cli.first_sync.map(Into::into))
            .await?;
        if outcome == SignInOutcome::ChoiceRequired {
            bail!("Local data found. Re-run with --first-sync merge or --first-sync overwrite");
        }
    }
    Ok(())
}

async fn run_command(app: &mut App, command: Commands, events: UnboundedReceiver<SessionEvent>) -> Result<()> {
    match command {
        Commands::Log { exercise, sets, reps, weight, unit, notes } => {
            let settings = app.settings().clone();
            let name = exercise.unwrap_or(settings.default_exercise_name);
            let spec = ExerciseSpec::new(
                &name,
                sets.unwrap_or(settings.default_sets),
                reps.unwrap_or(settings.default_reps),
                weight.unwrap_or(settings.default_weight),
                unit.unwrap_or(settings.default_unit),
            );
            let (sets, reps) = (spec.sets, spec.reps);
            app.add_exercise(spec)?;
            if notes.is_some() {
                app.update_session(SessionPatch {
                    notes,
                    ..Default::default()
                });
            }
            if let Some(session) = app.commit_session()? {
                println!("Logged: {} - {}x{} (id: {})", name, sets, reps, session.id);
            }
        }

        Commands::List { limit } => print_sessions(app, limit),

        Commands::Delete { id } => {
            if !app.delete_session(&id)? {
                bail!("No session with id {}", id);
            }
            println!("Deleted session {}", id);
        }

        Commands::Stats { exercise } => {
            let analytics = Analytics::new(app.dataset().sessions.clone());

            println!("Training Statistics");
            println!("{:-<40}", "");

            if let Some(ex) = exercise {
                println!("Exercise: {}", ex);
                println!("Total volume: {:.1} kg", analytics.total_volume(&ex));
                if let Some(best) = analytics.best_weight_kg(&ex) {
                    println!("Best weight: {:.1} kg", best);
                }
                if let Some((sets, reps)) = analytics.predict_next_load(&ex) {
                    println!("Suggested next: {}x{}", sets, reps);
                }
            } else {
                println!("Weekly frequency: {:.1} sessions/week", analytics.weekly_frequency());
                for (day, volume) in analytics.volume_by_day().iter().rev().take(7) {
                    println!("{} | {:>10.1} kg", day, volume);
                }
                if let Some(kg) = latest_bodyweight_kg(&app.dataset().health_entries) {
                    println!("Bodyweight: {:.1} kg", kg);
                }
            }
        }

        Commands::Health { action } => match action {
            HealthAction::Add { weight, unit, body_fat, sleep, water, heart_rate } => {
                let unit = unit.unwrap_or(app.settings().default_unit);
                let entry = app.add_health_entry(HealthEntry {
                    id: new_id(),
                    timestamp: Utc::now(),
                    bodyweight: weight,
                    bodyweight_unit: weight.map(|_| unit),
                    body_fat_percentage: body_fat,
                    sleep_hours: sleep,
                    water_intake_liters: water,
                    resting_heart_rate: heart_rate,
                })?;
                println!("Recorded (id: {})", entry.id);
            }
            HealthAction::List { limit } => {
                for e in app.dataset().health_by_recency().into_iter().take(limit) {
                    let weight = e
                        .bodyweight
                        .map(|w| format!("{} {}", w, e.bodyweight_unit.unwrap_or_default().as_str()))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} | weight {} | fat {} | sleep {} | {}",
                        e.timestamp.format("%Y-%m-%d %H:%M"),
                        weight,
                        e.body_fat_percentage.map_or("-".to_string(), |v| format!("{}%", v)),
                        e.sleep_hours.map_or("-".to_string(), |v| format!("{}h", v)),
                        e.id
                    );
                }
            }
            HealthAction::Delete { id } => {
                if !app.delete_health_entry(&id)? {
                    bail!("No health entry with id {}", id);
                }
                println!("Deleted health entry {}", id);
            }
        },

        Commands::Routine { action } => match action {
            RoutineAction::Add { name, exercises } => {
                let routine = app.add_routine(&name, exercises)?;
                println!("Created routine {} (id: {})", routine.name, routine.id);
            }
            RoutineAction::List => {
                for r in &app.dataset().routines {
                    let items: Vec<String> = r
                        .exercises
                        .iter()
                        .map(|e| format!("{} {}x{}", e.name, e.sets, e.reps))
                        .collect();
                    println!("{} | {:20} | {}", r.id, r.name, items.join(", "));
                }
            }
            RoutineAction::Delete { id } => {
                if !app.delete_routine(&id)? {
                    bail!("No routine with id {}", id);
                }
                println!("Deleted routine {}", id);
            }
        },

        Commands::Settings { exercise, sets, reps, weight, unit, timeout } => {
            let current = app.settings().clone();
            let updated = Settings {
                default_exercise_name: exercise.unwrap_or(current.default_exercise_name),
                default_sets: sets.unwrap_or(current.default_sets),
                default_reps: reps.unwrap_or(current.default_reps),
                default_weight: weight.unwrap_or(current.default_weight),
                default_unit: unit.unwrap_or(current.default_unit),
                session_timeout_minutes: timeout.unwrap_or(current.session_timeout_minutes),
            };
            app.update_settings(updated)?;
            println!("{}", serde_json::to_string_pretty(app.settings())?);
        }

        Commands::Export { output } => {
            let json = app.export_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::Import { path, merge } => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let mode = if merge { ImportMode::Merge } else { ImportMode::Replace };
            app.import_json(&json, mode)?;
            println!("Imported {} sessions total", app.dataset().sessions.len());
        }

        Commands::Sync => {
            app.sync_now().await?;
            println!("Synced {} sessions", app.dataset().sessions.len());
        }

        Commands::Shell => run_shell(app, events).await?,

        Commands::DeleteProfile => {
            if !app.delete_active_profile()? {
                bail!("Not signed in to a local profile");
            }
            println!("Profile deleted");
        }

        Commands::Register | Commands::ResetPassword { .. } | Commands::Reset { .. } => {}
    }
    Ok(())
}

// Pending pushes are lost if the process exits first
async fn finish_sync(app: &mut App) {
    match tokio::time::timeout(Duration::from_secs(10), app.flush_sync()).await {
        Ok(Some(SyncStatus::Failed { reason })) => {
            eprintln!("Sync failed, changes kept locally: {}", reason);
        }
        Ok(_) => {}
        Err(_) => eprintln!("Sync did not finish, changes kept locally"),
    }
}

fn print_sessions(app: &App, limit: usize) {
    println!("Recent sessions:");
    println!("{:-<72}", "");
    for s in app.dataset().sessions_by_recency().into_iter().take(limit) {
        println!(
            "{} | {:20} | {:>3} min | {:>2} ex | {:>8.1} kg | {}",
            s.timestamp.format("%Y-%m-%d %H:%M"),
            s.name.as_deref().unwrap_or("-"),
            s.duration_minutes.unwrap_or(0),
            s.exercises.len(),
            s.volume_kg(),
            s.id
        );
    }
}

fn print_active(app: &App) {
    let Some(active) = app.session().active() else {
        println!("No active session");
        return;
    };
    let mode = match active.mode {
        SessionMode::New => "new",
        SessionMode::Editing => "editing",
    };
    println!("{} ({})", active.session.name.as_deref().unwrap_or("Workout"), mode);
    for e in &active.session.exercises {
        println!("  {:20} | {}x{} @ {} {} | {}", e.name, e.sets, e.reps, e.weight, e.unit.as_str(), e.id);
    }
}

const SHELL_HELP: &str = "\
start                         open an empty session
add NAME [SETSxREPS] [W] [U]  log an exercise (starts a session if needed)
remove ID                     drop an exercise row
name TEXT | note TEXT         set session name or notes
routine ID                    start from a routine
edit ID                       reopen a logged session
show | list                   active session | history
commit | cancel               save or discard the active session
sync                          reconcile with the cloud account
quit";

async fn run_shell(app: &mut App, mut events: UnboundedReceiver<SessionEvent>) -> Result<()> {
    println!("fitsync shell. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_shell_command(app, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("Error: {}", e),
                }
            }
            Some(event) = events.recv() => {
                if let Some(session) = app.handle_session_event(event)? {
                    println!("Session saved after inactivity ({} exercises)", session.exercises.len());
                }
            }
        }
    }

    // leaving keeps what was logged
    app.commit_session()?;
    Ok(())
}

fn parse_add(args: &str, settings: &Settings) -> Result<ExerciseSpec> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let load_at = tokens.iter().position(|t| parse_sets_reps(t).is_some());
    let name_end = load_at.unwrap_or(tokens.len());
    if name_end == 0 {
        bail!("usage: add NAME [SETSxREPS] [WEIGHT] [UNIT]");
    }

    let (sets, reps) = load_at
        .and_then(|i| parse_sets_reps(tokens[i]))
        .unwrap_or((settings.default_sets, settings.default_reps));
    let rest = load_at.map_or(&[][..], |i| &tokens[i + 1..]);
    let weight = match rest.first() {
        Some(w) => w.parse().with_context(|| format!("bad weight '{}'", w))?,
        None => settings.default_weight,
    };
    let unit = match rest.get(1) {
        Some(u) => u.parse()?,
        None => settings.default_unit,
    };

    Ok(ExerciseSpec::new(&tokens[..name_end].join(" "), sets, reps, weight, unit))
}

async fn run_shell_command(app: &mut App, line: &str) -> Result<bool> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match cmd {
        "" => {}
        "help" => println!("{}", SHELL_HELP),
        "start" => {
            app.start_session()?;
            println!("Session started");
        }
        "add" => {
            let spec = parse_add(rest, app.settings())?;
            app.add_exercise(spec)?;
            print_active(app);
        }
        "remove" => {
            if !app.remove_exercise(rest) {
                println!("No such exercise in the active session");
            }
        }
        "name" | "note" => {
            let patch = if cmd == "name" {
                SessionPatch {
                    name: Some(rest.to_string()),
                    ..Default::default()
                }
            } else {
                SessionPatch {
                    notes: Some(rest.to_string()),
                    ..Default::default()
                }
            };
            if !app.update_session(patch) {
                println!("No active session");
            }
        }
        "routine" => {
            app.start_routine(rest)?;
            print_active(app);
        }
        "edit" => {
            app.edit_session(rest)?;
            print_active(app);
        }
        "show" => print_active(app),
        "list" => print_sessions(app, 10),
        "commit" => match app.commit_session()? {
            Some(s) => println!("Saved session {}", s.id),
            None => println!("Nothing to save"),
        },
        "cancel" => {
            if app.cancel_session().is_some() {
                println!("Session discarded");
            }
        }
        "sync" => {
            app.sync_now().await?;
            println!("Synced");
        }
        "quit" | "exit" => return Ok(false),
        other => println!("Unknown command '{}', try 'help'", other),
    }
    Ok(true)
}
