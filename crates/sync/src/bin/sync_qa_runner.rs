use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use chatsync::{
    ChatId, DurableStore, MemoryAuthority, MemoryStorage, MessageId, MessageRole, NewChat,
    NewMessage, RecencyConfig, RemoteAuthority, RemoteError, RemoteOp, SqliteStorage,
    StorageError, SyncEngine, SyncError,
};

const OWNER_ID: &str = "qa-user";
const MODEL: &str = "gpt-4o";

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    TripPlanning,
    VersionSwitch,
    Rollback,
    Dedup,
    RecencyEviction,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "trip_planning" => Some(Self::TripPlanning),
            "version_switch" => Some(Self::VersionSwitch),
            "rollback" => Some(Self::Rollback),
            "dedup" => Some(Self::Dedup),
            "recency_eviction" => Some(Self::RecencyEviction),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::TripPlanning => "trip_planning",
            Self::VersionSwitch => "version_switch",
            Self::Rollback => "rollback",
            Self::Dedup => "dedup",
            Self::RecencyEviction => "recency_eviction",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("store setup failed: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("remote seeding failed: {source}"))]
    Seed {
        stage: &'static str,
        source: RemoteError,
    },
    #[snafu(display("sync operation failed: {source}"))]
    Sync {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

struct Harness {
    engine: SyncEngine,
    store: Arc<dyn DurableStore>,
    remote: Arc<MemoryAuthority>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }
    let db_path = args.db_path.as_deref();

    match args.scenario {
        Scenario::TripPlanning => run_trip_planning(db_path).await,
        Scenario::VersionSwitch => run_version_switch(db_path).await,
        Scenario::Rollback => run_rollback(db_path).await,
        Scenario::Dedup => run_dedup(db_path).await,
        Scenario::RecencyEviction => run_recency_eviction(db_path).await,
        Scenario::All => run_all(db_path).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_trip_planning(db_path).await?;
    run_version_switch(db_path).await?;
    run_rollback(db_path).await?;
    run_dedup(db_path).await?;
    run_recency_eviction(db_path).await?;
    println!("all_passed=true");
    Ok(())
}

async fn run_trip_planning(db_path: Option<&str>) -> RunnerResult<()> {
    let scenario = "trip_planning";
    let harness = open_harness(db_path, RecencyConfig::default()).await?;
    let engine = &harness.engine;

    let created = engine.create_chat(NewChat::new("Trip planning", MODEL));
    let provisional = created.id().clone();
    let greeting = engine
        .add_message(NewMessage::user(provisional.clone(), "Hi"))
        .await
        .context(SyncSnafu {
            stage: "scenario-trip-planning-add-greeting",
        })?;
    let reply = engine
        .add_message(NewMessage::assistant(provisional.clone(), "Where to?"))
        .await
        .context(SyncSnafu {
            stage: "scenario-trip-planning-add-reply",
        })?;
    let optimistic_count = engine.get_messages(&provisional).await.len();

    let chat = created.confirmed().await.context(SyncSnafu {
        stage: "scenario-trip-planning-confirm",
    })?;
    let messages = engine.get_messages(&provisional).await;
    let contents = messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    let all_durable = messages.iter().all(|message| !message.id.is_provisional());
    let resolved_greeting = engine.resolve_message_id(&greeting);
    let stored = harness
        .store
        .list_messages(chat.id.clone())
        .await
        .context(StorageSnafu {
            stage: "scenario-trip-planning-read-store",
        })?;
    let orphan_rows = harness
        .store
        .list_messages(provisional.clone())
        .await
        .context(StorageSnafu {
            stage: "scenario-trip-planning-read-orphans",
        })?
        .len();
    let remote_messages = match chat.id.as_durable() {
        Some(durable) => harness.remote.messages_for(durable).len(),
        None => 0,
    };

    println!("provisional_id={provisional}");
    println!("durable_id={}", chat.id);
    println!("optimistic_messages={optimistic_count}");
    println!("messages={}", contents.join("|"));
    println!("messages_durable={all_durable}");
    println!("greeting_resolved={}", !resolved_greeting.is_provisional());
    println!("reply_queued={}", reply.is_provisional());
    println!("stored_messages={}", stored.len());
    println!("orphan_rows={orphan_rows}");
    println!("remote_messages={remote_messages}");

    if chat.id.is_provisional() || optimistic_count != 2 || contents != ["Hi", "Where to?"] {
        return scenario_failed(
            scenario,
            "scenario-trip-planning-assert-view",
            format!("unexpected reconciled view: durable={} view={contents:?}", chat.id),
        );
    }
    if !all_durable || resolved_greeting.is_provisional() || orphan_rows != 0 {
        return scenario_failed(
            scenario,
            "scenario-trip-planning-assert-reconcile",
            "provisional ids survived reconciliation".to_string(),
        );
    }
    if stored.len() != 2 || remote_messages != 2 {
        return scenario_failed(
            scenario,
            "scenario-trip-planning-assert-tiers",
            format!("store={} remote={remote_messages}", stored.len()),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_version_switch(db_path: Option<&str>) -> RunnerResult<()> {
    let scenario = "version_switch";
    let harness = open_harness(db_path, RecencyConfig::default()).await?;
    let engine = &harness.engine;
    let (chat_id, original) = seed_chat_with_message(&harness, "Versions").await?;

    let retry = engine
        .add_message(
            NewMessage::assistant(chat_id.clone(), "second answer").with_parent(original.clone()),
        )
        .await
        .context(SyncSnafu {
            stage: "scenario-version-switch-add-retry",
        })?;
    let versions = engine.message_versions(&retry);
    let active_after_retry = active_contents(engine, &chat_id).await;

    let switched = engine
        .switch_message_version(&original)
        .await
        .context(SyncSnafu {
            stage: "scenario-version-switch-switch",
        })?;
    let active_after_switch = switched
        .iter()
        .map(|message| message.content.clone())
        .collect::<Vec<_>>();

    println!("versions={}", versions.len());
    println!("active_after_retry={}", active_after_retry.join("|"));
    println!("active_after_switch={}", active_after_switch.join("|"));

    let version_numbers = versions
        .iter()
        .map(|message| message.version)
        .collect::<Vec<_>>();
    if version_numbers != [1, 2] || active_after_retry != ["second answer"] {
        return scenario_failed(
            scenario,
            "scenario-version-switch-assert-retry",
            format!("versions={version_numbers:?} active={active_after_retry:?}"),
        );
    }
    if active_after_switch != ["first answer"] {
        return scenario_failed(
            scenario,
            "scenario-version-switch-assert-switch",
            format!("active={active_after_switch:?}"),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_rollback(db_path: Option<&str>) -> RunnerResult<()> {
    let scenario = "rollback";
    let harness = open_harness(db_path, RecencyConfig::default()).await?;
    let engine = &harness.engine;
    let (chat_id, _) = seed_chat_with_message(&harness, "Rollback").await?;
    let before = active_contents(engine, &chat_id).await;

    harness.remote.fail_next(RemoteOp::AddMessage, 1);
    let rejected = engine
        .add_message(NewMessage::user(chat_id.clone(), "lost in transit"))
        .await
        .is_err();
    let after = active_contents(engine, &chat_id).await;
    let stored = harness
        .store
        .list_messages(chat_id.clone())
        .await
        .context(StorageSnafu {
            stage: "scenario-rollback-read-store",
        })?;

    println!("rejected={rejected}");
    println!("before={}", before.join("|"));
    println!("after={}", after.join("|"));
    println!("stored_messages={}", stored.len());

    if !rejected || before != after || stored.len() != before.len() {
        return scenario_failed(
            scenario,
            "scenario-rollback-assert",
            format!("before={before:?} after={after:?} stored={}", stored.len()),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_dedup(db_path: Option<&str>) -> RunnerResult<()> {
    let scenario = "dedup";
    let harness = open_harness(db_path, RecencyConfig::default()).await?;
    let chat = harness
        .remote
        .seed_chat("Dedup", OWNER_ID, MODEL)
        .context(SeedSnafu {
            stage: "scenario-dedup-seed-chat",
        })?;
    if let Some(durable) = chat.id.as_durable() {
        harness
            .remote
            .seed_message(durable, MessageRole::User, "cold")
            .context(SeedSnafu {
                stage: "scenario-dedup-seed-message",
            })?;
    }
    harness
        .remote
        .push_delay(RemoteOp::GetMessages, Duration::from_millis(50));

    let engine = &harness.engine;
    let (first, second, third) = tokio::join!(
        engine.get_messages(&chat.id),
        engine.get_messages(&chat.id),
        engine.get_messages(&chat.id),
    );
    let remote_reads = harness.remote.calls(RemoteOp::GetMessages);
    let same = first == second && second == third;

    println!("remote_reads={remote_reads}");
    println!("results_identical={same}");
    println!("messages={}", first.len());

    if remote_reads != 1 || !same || first.len() != 1 {
        return scenario_failed(
            scenario,
            "scenario-dedup-assert",
            format!("remote_reads={remote_reads} identical={same}"),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_recency_eviction(db_path: Option<&str>) -> RunnerResult<()> {
    let scenario = "recency_eviction";
    let capacity = 2;
    let harness = open_harness(
        db_path,
        RecencyConfig {
            capacity,
            ..RecencyConfig::default()
        },
    )
    .await?;
    let engine = &harness.engine;

    for index in 0..capacity + 2 {
        let (chat_id, _) = seed_chat_with_message(&harness, &format!("Chat {index}")).await?;
        engine.get_messages(&chat_id).await;
    }
    let stats = engine.cache_stats();

    println!("capacity={capacity}");
    println!("recent_chats={}", stats.recent_chats);
    println!("cached_message_lists={}", stats.cached_message_lists);

    if stats.recent_chats != capacity || stats.cached_message_lists != capacity + 2 {
        return scenario_failed(
            scenario,
            "scenario-recency-eviction-assert",
            format!("stats={stats:?}"),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn open_harness(db_path: Option<&str>, recency: RecencyConfig) -> RunnerResult<Harness> {
    let store: Arc<dyn DurableStore> = match db_path {
        Some(path) => {
            reset_sqlite_files(path)?;
            Arc::new(SqliteStorage::open(path).await.context(StorageSnafu {
                stage: "open-harness-sqlite",
            })?)
        }
        None => Arc::new(MemoryStorage::new()),
    };
    let remote = Arc::new(MemoryAuthority::new());
    let authority: Arc<dyn RemoteAuthority> = remote.clone();
    let engine = SyncEngine::new(Arc::clone(&store), authority, &recency);
    engine.set_owner(Some(OWNER_ID.to_string()));

    Ok(Harness {
        engine,
        store,
        remote,
    })
}

/// A remote chat holding one active assistant message, loaded into the engine.
async fn seed_chat_with_message(
    harness: &Harness,
    name: &str,
) -> RunnerResult<(ChatId, MessageId)> {
    let chat = harness
        .remote
        .seed_chat(name, OWNER_ID, MODEL)
        .context(SeedSnafu {
            stage: "seed-chat",
        })?;
    let durable = chat.id.as_durable().context(ScenarioFailedSnafu {
        stage: "seed-chat-durable",
        scenario: "seed",
        reason: "remote minted a provisional id".to_string(),
    })?;
    let message = harness
        .remote
        .seed_message(durable, MessageRole::Assistant, "first answer")
        .context(SeedSnafu {
            stage: "seed-message",
        })?;
    harness.engine.get_messages(&chat.id).await;
    Ok((chat.id, message.id))
}

async fn active_contents(engine: &SyncEngine, chat_id: &ChatId) -> Vec<String> {
    engine
        .get_messages(chat_id)
        .await
        .into_iter()
        .map(|message| message.content)
        .collect()
}

fn scenario_failed(
    scenario: &'static str,
    stage: &'static str,
    reason: String,
) -> RunnerResult<()> {
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason,
    }
    .fail()
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}
