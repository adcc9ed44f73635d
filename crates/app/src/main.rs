use std::fmt;
use std::sync::Arc;

use exam_core::model::{ExamFamily, PaperId, QuestionRange, SessionConfig, SessionId};
use services::{Clock, PersistOutcome, PersistenceGateway, SessionController, SyncSettings};
use storage::{HttpSessionRemote, InMemorySessionRemote, RemoteConfig, SessionRemote, Storage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidRange { raw: String },
    InvalidNumber { flag: &'static str, raw: String },
    InvalidSessionId { raw: String },
    MissingCommand,
    MissingPaper,
    MissingSessionId,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidRange { raw } => {
                write!(f, "invalid --range value: {raw} (expected <start>-<end>)")
            }
            ArgsError::InvalidNumber { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidSessionId { raw } => write!(f, "invalid session id: {raw}"),
            ArgsError::MissingCommand => write!(f, "missing subcommand"),
            ArgsError::MissingPaper => write!(f, "start requires --paper"),
            ArgsError::MissingSessionId => write!(f, "a session id is required"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_number(raw: String, flag: &'static str) -> Result<u32, ArgsError> {
    raw.trim()
        .parse()
        .map_err(|_| ArgsError::InvalidNumber { flag, raw })
}

fn parse_range(raw: String) -> Result<QuestionRange, ArgsError> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| ArgsError::InvalidRange { raw: raw.clone() })?;
    let start: u32 = start
        .trim()
        .parse()
        .map_err(|_| ArgsError::InvalidRange { raw: raw.clone() })?;
    let end: u32 = end
        .trim()
        .parse()
        .map_err(|_| ArgsError::InvalidRange { raw: raw.clone() })?;
    QuestionRange::new(start, end).map_err(|_| ArgsError::InvalidRange { raw })
}

fn parse_session_id(raw: String) -> Result<SessionId, ArgsError> {
    raw.parse()
        .map_err(|_| ArgsError::InvalidSessionId { raw })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- [--db <sqlite_url>] [--offline] <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  start --paper <id> --range <a-b> --minutes <n> [--variant <v>] [--name <n>]");
    eprintln!("        [--family standard|fixed] [--sections <a,b,...>]");
    eprintln!("  resume  <session_id>   restore a session and print its timing");
    eprintln!("  end     <session_id>   restore a session and mark it ended now");
    eprintln!("  abandon <session_id>   restore a session and discard it");
    eprintln!("  list                   in-progress sessions on the server and in the cache");
    eprintln!("  flush                  push cached snapshots and queued writes to the server");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite://exam.sqlite3");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  EXAM_DB_URL, EXAM_API_BASE_URL, EXAM_API_TOKEN, EXAM_API_TIMEOUT_SECS");
    eprintln!("  EXAM_SYNC_DEBOUNCE_MS, EXAM_SYNC_MAX_RETRIES, EXAM_OUTBOX_MAX_AGE_SECS");
    eprintln!("  EXAM_OUTBOX_SWEEP_SECS, EXAM_INSTRUCTION_SECS, RUST_LOG");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start(SessionConfig),
    Resume(SessionId),
    End(SessionId),
    Abandon(SessionId),
    List,
    Flush,
}

impl Command {
    fn parse(name: &str, args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        match name {
            "start" => Self::parse_start(args),
            "resume" => Ok(Self::Resume(Self::parse_id(args)?)),
            "end" => Ok(Self::End(Self::parse_id(args)?)),
            "abandon" => Ok(Self::Abandon(Self::parse_id(args)?)),
            "list" => Ok(Self::List),
            "flush" => Ok(Self::Flush),
            other => Err(ArgsError::UnknownArg(other.to_string())),
        }
    }

    fn parse_id(args: &mut impl Iterator<Item = String>) -> Result<SessionId, ArgsError> {
        let raw = args.next().ok_or(ArgsError::MissingSessionId)?;
        parse_session_id(raw)
    }

    fn parse_start(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut paper = None;
        let mut range = None;
        let mut minutes = 0;
        let mut variant = String::new();
        let mut name = String::new();
        let mut family = ExamFamily::default();
        let mut sections = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--paper" => paper = Some(PaperId::new(require_value(args, "--paper")?)),
                "--range" => range = Some(parse_range(require_value(args, "--range")?)?),
                "--minutes" => minutes = parse_number(require_value(args, "--minutes")?, "--minutes")?,
                "--variant" => variant = require_value(args, "--variant")?,
                "--name" => name = require_value(args, "--name")?,
                "--family" => {
                    let value = require_value(args, "--family")?;
                    family = match value.as_str() {
                        "standard" => ExamFamily::Standard,
                        "fixed" => ExamFamily::FixedTimer,
                        _ => return Err(ArgsError::UnknownArg(value)),
                    };
                }
                "--sections" => {
                    sections = require_value(args, "--sections")?
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let paper_id = paper.ok_or(ArgsError::MissingPaper)?;
        let question_range = range.ok_or(ArgsError::MissingValue { flag: "--range" })?;
        Ok(Self::Start(SessionConfig {
            paper_variant: variant,
            session_name: name,
            exam_family: family,
            selected_sections: sections,
            ..SessionConfig::new(paper_id, question_range, minutes)
        }))
    }
}

struct Args {
    db_url: String,
    offline: bool,
    command: Command,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("EXAM_DB_URL")
            .ok()
            .map_or_else(|| "sqlite://exam.sqlite3".into(), normalize_sqlite_url);
        let mut offline = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--offline" => offline = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => return Err(ArgsError::UnknownArg(arg)),
                _ => {
                    let command = Command::parse(&arg, args)?;
                    return Ok(Self {
                        db_url,
                        offline,
                        command,
                    });
                }
            }
        }

        Err(ArgsError::MissingCommand)
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_remote(offline: bool) -> Result<Arc<dyn SessionRemote>, Box<dyn std::error::Error>> {
    if !offline {
        if let Some(config) = RemoteConfig::from_env() {
            info!(base_url = %config.base_url, "using remote session store");
            return Ok(Arc::new(HttpSessionRemote::new(config)?));
        }
        warn!("EXAM_API_BASE_URL not set; writes stay in the local cache");
    }
    Ok(Arc::new(InMemorySessionRemote::new()))
}

fn print_status(controller: &SessionController) {
    let Some(session) = controller.session() else {
        return;
    };
    let remaining = controller.remaining_time().num_seconds();
    println!("session   {}", session.id());
    println!("paper     {}", session.paper_id().as_str());
    println!("questions {}", controller.total_questions());
    println!("answered  {}", controller.answered_count());
    println!("remaining {:02}:{:02}", remaining / 60, remaining % 60);
    if session.is_ended() {
        println!("status    ended");
    } else if controller.timing().is_some_and(|t| t.is_paused()) {
        println!("status    paused");
    } else {
        println!("status    running");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv = std::env::args().skip(1);
    let parsed = Args::parse(&mut argv).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    init_tracing();

    // Open + migrate SQLite at startup. Keep this in the binary glue so services stay pure.
    prepare_sqlite_file(&parsed.db_url)?;
    let storage = Storage::sqlite(&parsed.db_url).await?;
    let remote = build_remote(parsed.offline)?;
    let clock = Clock::default_clock();
    let gateway = PersistenceGateway::new(remote, storage.cache, clock.clone(), SyncSettings::from_env());
    let mut controller = SessionController::new(clock.clone(), gateway.clone());

    match parsed.command {
        Command::Start(config) => {
            controller.start_session(config).await?;
            print_status(&controller);
        }
        Command::Resume(id) => {
            controller.restore_session(id).await?;
            print_status(&controller);
        }
        Command::End(id) => {
            controller.restore_session(id).await?;
            controller.set_ended_at(clock.now()).await?;
            print_status(&controller);
        }
        Command::Abandon(id) => {
            controller.restore_session(id).await?;
            controller.reset_session().await?;
            println!("abandoned {id}");
        }
        Command::List => {
            match controller.in_progress_sessions().await {
                Ok(records) => {
                    for record in records {
                        println!(
                            "remote {} {} started {}",
                            record.id,
                            record.paper_id.as_str(),
                            record.started_at.to_rfc3339()
                        );
                    }
                }
                Err(err) => warn!(error = %err, "could not list remote sessions"),
            }
            for id in gateway.cached_sessions().await? {
                println!("cached {id}");
            }
        }
        Command::Flush => {
            let mut synced = 0usize;
            for id in gateway.cached_sessions().await? {
                let snapshot = match gateway.load_cache(id).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        warn!(session_id = %id, error = %err, "skipping unreadable snapshot");
                        continue;
                    }
                };
                match gateway.persist_now(snapshot.record).await {
                    Ok(PersistOutcome::Synced) => synced += 1,
                    Ok(outcome) => info!(session_id = %id, ?outcome, "snapshot not synced"),
                    Err(err) => warn!(session_id = %id, error = %err, "snapshot rejected"),
                }
            }
            let replayed = controller.process_pending_persists().await;
            println!("synced {synced}, replayed {replayed}");
        }
    }

    gateway.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // At this layer (binary glue), printing once is fine.
        eprintln!("{err}");
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> impl Iterator<Item = String> {
        raw.iter().map(|s| (*s).to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn start_command_builds_config() {
        let parsed = Args::parse(&mut args(&[
            "--db",
            "sqlite::memory:",
            "start",
            "--paper",
            "toeic-7",
            "--range",
            "101-200",
            "--minutes",
            "75",
            "--family",
            "fixed",
            "--sections",
            "Reading, Listening",
        ]))
        .unwrap();

        assert_eq!(parsed.db_url, "sqlite::memory:");
        let Command::Start(config) = parsed.command else {
            panic!("expected start");
        };
        assert_eq!(config.paper_id.as_str(), "toeic-7");
        assert_eq!(config.question_range.total(), 100);
        assert_eq!(config.time_limit_minutes, 75);
        assert_eq!(config.exam_family, ExamFamily::FixedTimer);
        assert_eq!(config.selected_sections, vec!["Reading", "Listening"]);
    }

    #[test]
    fn rejects_inverted_range() {
        let err = Args::parse(&mut args(&["start", "--paper", "p", "--range", "9-3"]))
            .err()
            .unwrap();
        assert!(matches!(err, ArgsError::InvalidRange { .. }));
    }

    #[test]
    fn session_commands_require_an_id() {
        let err = Args::parse(&mut args(&["resume"])).err().unwrap();
        assert!(matches!(err, ArgsError::MissingSessionId));

        let id = SessionId::generate();
        let parsed = Args::parse(&mut args(&["--offline", "abandon", &id.to_string()])).unwrap();
        assert!(parsed.offline);
        assert_eq!(parsed.command, Command::Abandon(id));
    }

    #[test]
    fn missing_command_is_an_error() {
        let err = Args::parse(&mut args(&["--offline"])).err().unwrap();
        assert!(matches!(err, ArgsError::MissingCommand));
    }

    #[test]
    fn normalizes_relative_paths() {
        let url = normalize_sqlite_url("sqlite:data/exam.db".into());
        assert!(url.starts_with("sqlite:///"));
        assert!(url.ends_with("data/exam.db"));
    }
}
