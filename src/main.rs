mod audit;
mod board;
mod budget;
mod channels;
mod config;
mod cron;
mod db;
mod dispatch;
mod knowledge;
mod notify;
mod reminders;
mod retention;
mod router;
mod runner;
mod setup;
mod skills;
mod task;
mod template;
mod time_parse;
mod trust;
mod watcher;
mod web;

use channels::ChannelAdapter;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tetora", version, about = "Personal AI orchestration daemon")]
struct Cli {
    /// Path to config file (default: ~/.tetora/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Retention management
    Data {
        #[command(subcommand)]
        action: DataAction,
    },
    /// Cron job CRUD
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Cost rollup
    Usage {
        /// today|week|month
        #[arg(default_value = "today")]
        window: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },
    /// Knowledge index (external to the core)
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },
    /// Skill lifecycle
    Skill {
        #[command(subcommand)]
        action: SkillAction,
    },
    /// Create a new config directory
    Init,
}

#[derive(Subcommand)]
enum DataAction {
    Status,
    Cleanup,
    Export,
    Purge,
}

#[derive(Subcommand)]
enum JobAction {
    List,
    Add {
        name: String,
        schedule: String,
        prompt: String,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Job ids to trigger when this job succeeds.
        #[arg(long = "on-success", value_delimiter = ',')]
        on_success: Vec<i64>,
        /// Job ids to trigger when this job exhausts its retries.
        #[arg(long = "on-failure", value_delimiter = ',')]
        on_failure: Vec<i64>,
    },
    Enable { id: i64 },
    Disable { id: i64 },
    Remove { id: i64 },
    Trigger { id: i64 },
}

#[derive(Subcommand)]
enum KnowledgeAction {
    List,
    Add { id: String, text: String },
    Remove { id: String },
    Search { query: String },
    Path,
}

#[derive(Subcommand)]
enum SkillAction {
    List,
    Run {
        name: String,
        #[arg(long, default_value = "ask")]
        agent: String,
    },
    Test { name: String },
    Store { name: String, file: PathBuf },
    Approve { name: String },
    Reject { name: String },
    Install { name: String, file: PathBuf },
    Search { query: String },
    Scan { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("tetora=info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| config::config_dir().join("config.json"));

    match cli.command {
        Some(Commands::Init) => run_init(&config_path),
        Some(Commands::Data { action }) => run_data(&config_path, action).await,
        Some(Commands::Job { action }) => run_job(&config_path, action).await,
        Some(Commands::Usage { window, model, agent, days }) => run_usage(&config_path, window, model, agent, days).await,
        Some(Commands::Knowledge { action }) => run_knowledge(&config_path, action).await,
        Some(Commands::Skill { action }) => run_skill(&config_path, action).await,
        None => run_daemon(&config_path).await,
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

fn run_init(config_path: &std::path::Path) -> anyhow::Result<()> {
    let dir = config_path.parent().map(|d| d.to_path_buf()).unwrap_or_else(config::config_dir);
    std::fs::create_dir_all(&dir)?;
    std::fs::create_dir_all(dir.join("skills"))?;

    if !config_path.exists() {
        std::fs::write(
            config_path,
            serde_json::to_string_pretty(&serde_json::json!({
                "agent": {
                    "binary": "claude",
                    "default_model": "claude-sonnet-4-20250514",
                    "workdir": "~/tetora/work",
                    "max_concurrent": 4,
                },
                "channels": {
                    "telegram": {
                        "bot_token": "${TELEGRAM_BOT_TOKEN}",
                        "allowed_senders": [],
                        "debounce_ms": 2000,
                    }
                },
                "security": {
                    "shell_deny_patterns": ["rm -rf", "sudo", "chmod 777"]
                },
            }))?,
        )?;
        println!("Created {}", config_path.display());
    } else {
        println!("Config already exists: {}", config_path.display());
    }

    println!("tetora initialized at {}", dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

async fn run_data(config_path: &std::path::Path, action: DataAction) -> anyhow::Result<()> {
    let store = config::ConfigStore::load(config_path)?;
    let cfg = store.read();
    let db = db::Db::open(&cfg.db_path())?;

    match action {
        DataAction::Status => {
            let sessions = db.session_list_active(1000).await?;
            let audit = db.audit_query(1).await?;
            println!("=== Data status ===");
            println!("active sessions: {}", sessions.len());
            println!(
                "retention: history={}d audit_log={}d sessions={}d trust_events={}d",
                cfg.retention.history, cfg.retention.audit_log, cfg.retention.sessions, cfg.retention.trust_events
            );
            println!("audit log has entries: {}", !audit.is_empty());
        }
        DataAction::Cleanup | DataAction::Purge => {
            let report = retention::run_cleanup(&db, &cfg.retention).await?;
            println!(
                "purged {} history rows, {} audit rows, {} sessions, {} trust events",
                report.history_purged, report.audit_log_purged, report.sessions_purged, report.trust_events_purged
            );
        }
        DataAction::Export => {
            let history = db.history_recent(None, 10_000).await?;
            let rows: Vec<_> = history
                .iter()
                .map(|h| serde_json::json!({ "task_id": h.task_id, "name": h.name, "agent": h.agent, "status": h.status, "cost_usd": h.cost_usd }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

async fn run_job(config_path: &std::path::Path, action: JobAction) -> anyhow::Result<()> {
    let store = config::ConfigStore::load(config_path)?;
    let cfg = store.read();
    let db = db::Db::open(&cfg.db_path())?;
    let provider = Arc::new(runner::SubprocessProvider { default_binary: cfg.agent.binary.clone() });
    let task_runner = runner::TaskRunner::new(db.clone(), provider, cfg.agent.max_concurrent);
    let audit = Arc::new(audit::AuditWriter::spawn(db.clone()));
    let engine = Arc::new(cron::CronEngine::new(db, task_runner, None, audit, cfg.workdir(), cfg.agent.default_model.clone()));

    match action {
        JobAction::List => {
            for job in engine.list_jobs().await? {
                println!(
                    "[{}] {} ({}) enabled={} last_run={:?} errors={}",
                    job.id, job.name, job.schedule, job.enabled, job.last_run, job.consecutive_errors
                );
            }
        }
        JobAction::Add { name, schedule, prompt, agent, model, on_success, on_failure } => {
            let template = serde_json::json!({ "prompt": prompt, "model": model }).to_string();
            let id = engine
                .add_job(db::cron::CronJobInsert {
                    name: &name,
                    schedule: &schedule,
                    timezone: "UTC",
                    agent: agent.as_deref(),
                    task_template_json: &template,
                    notify: true,
                    max_retries: 2,
                    retry_delay_secs: 30,
                    requires_approval: false,
                    approval_timeout_secs: 300,
                    on_success: &on_success,
                    on_failure: &on_failure,
                })
                .await?;
            println!("created job {id}");
        }
        JobAction::Enable { id } => {
            engine.enable_job(id, true).await?;
            println!("enabled job {id}");
        }
        JobAction::Disable { id } => {
            engine.enable_job(id, false).await?;
            println!("disabled job {id}");
        }
        JobAction::Remove { id } => {
            engine.remove_job(id).await?;
            println!("removed job {id}");
        }
        JobAction::Trigger { id } => {
            engine.trigger_job(id).await?;
            println!("triggered job {id}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

async fn run_usage(config_path: &std::path::Path, window: String, model: Option<String>, agent: Option<String>, days: Option<u32>) -> anyhow::Result<()> {
    let store = config::ConfigStore::load(config_path)?;
    let db = db::Db::open(&store.read().db_path())?;

    let now = db::now_ms();
    let since = if let Some(d) = days {
        now.saturating_sub(d as u64 * 86_400_000)
    } else {
        match window.as_str() {
            "week" => now.saturating_sub(7 * 86_400_000),
            "month" => now.saturating_sub(30 * 86_400_000),
            _ => db::audit::today_start_ms(),
        }
    };
    let total = db.history_cost_since(since, agent.as_deref(), model.as_deref()).await?;
    println!("spend since {since}: ${total:.4}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Knowledge
// ---------------------------------------------------------------------------

async fn run_knowledge(config_path: &std::path::Path, action: KnowledgeAction) -> anyhow::Result<()> {
    let store = config::ConfigStore::load(config_path)?;
    let cfg = store.read();
    let idx = knowledge::KnowledgeIndex::new(cfg.workdir().join("knowledge.json"));

    match action {
        KnowledgeAction::List => {
            for note in idx.list()? {
                println!("{}: {}", note.id, note.text);
            }
        }
        KnowledgeAction::Add { id, text } => {
            idx.add(&id, &text)?;
            println!("stored note {id}");
        }
        KnowledgeAction::Remove { id } => {
            idx.remove(&id)?;
            println!("removed note {id}");
        }
        KnowledgeAction::Search { query } => {
            for note in idx.search_ranked(&query, 5) {
                println!("{}: {}", note.id, note.text);
            }
        }
        KnowledgeAction::Path => println!("{}", idx.path().display()),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Skill
// ---------------------------------------------------------------------------

async fn run_skill(config_path: &std::path::Path, action: SkillAction) -> anyhow::Result<()> {
    let store = config::ConfigStore::load(config_path)?;
    let cfg = store.read();
    let skills_dir = cfg.skills_dirs().into_iter().next().unwrap_or_else(|| config::config_dir().join("skills"));
    let registry = skills::SkillRegistry::new(skills_dir);

    match action {
        SkillAction::List => {
            for skill in registry.list() {
                println!("{} ({:?}) - {}", skill.name, skill.source, skill.description);
            }
        }
        SkillAction::Run { name, agent } => {
            let db = db::Db::open(&cfg.db_path())?;
            let provider = Arc::new(runner::SubprocessProvider { default_binary: cfg.agent.binary.clone() });
            let task_runner = runner::TaskRunner::new(db, provider, cfg.agent.max_concurrent);
            let result = registry.run(&task_runner, &name, &agent, &cfg.agent.default_model, cfg.workdir()).await?;
            println!("{}", result.output);
        }
        SkillAction::Test { name } => {
            let result = registry.test(&name)?;
            println!("{:?} (score {})", result.verdict, result.score);
        }
        SkillAction::Store { name, file } => {
            let content = std::fs::read_to_string(file)?;
            let result = registry.store(&name, &content)?;
            println!("stored {name}: {:?} (score {})", result.verdict, result.score);
        }
        SkillAction::Approve { name } => {
            registry.approve(&name)?;
            println!("approved {name}");
        }
        SkillAction::Reject { name } => {
            registry.reject(&name)?;
            println!("rejected {name}");
        }
        SkillAction::Install { name, file } => {
            let result = registry.install(&name, &file)?;
            println!("installed {name}: {:?} (score {})", result.verdict, result.score);
        }
        SkillAction::Search { query } => {
            for skill in registry.search(&query) {
                println!("{} ({:?})", skill.name, skill.source);
            }
        }
        SkillAction::Scan { file } => {
            let content = std::fs::read_to_string(file)?;
            let result = registry.scan(&content);
            println!("{:?} (score {}): {:?}", result.verdict, result.score, result.findings);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

async fn run_daemon(config_path: &std::path::Path) -> anyhow::Result<()> {
    let store = Arc::new(config::ConfigStore::load(config_path)?);
    let cfg = store.read();
    let db = db::Db::open(&cfg.db_path())?;
    tracing::info!(path = %cfg.db_path().display(), "database opened");

    let (raw_tx, raw_rx) = tokio::sync::mpsc::unbounded_channel();
    let (coalesced_tx, mut coalesced_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut channel_debounce: HashMap<String, Duration> = HashMap::new();
    if let Some(ref tg) = cfg.channels.telegram {
        channel_debounce.insert("telegram".into(), Duration::from_millis(tg.debounce_ms));
    }
    if let Some(ref dc) = cfg.channels.discord {
        channel_debounce.insert("discord".into(), Duration::from_millis(dc.debounce_ms));
    }
    if let Some(ref sl) = cfg.channels.slack {
        channel_debounce.insert("slack".into(), Duration::from_millis(sl.debounce_ms));
    }

    let coalescer = channels::coalesce::MessageCoalescer::new(Duration::from_secs(2), raw_rx, coalesced_tx)
        .with_channel_debounce(channel_debounce);
    tokio::spawn(coalescer.run());

    let mut adapter_map: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if let Some(tg_config) = cfg.channels.telegram.clone() {
        let adapter = channels::telegram::TelegramAdapter::new(tg_config);
        adapter.start(raw_tx.clone()).await?;
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(adapter);
        adapter_map.insert(adapter.name().to_string(), adapter);
    }
    if let Some(dc_config) = cfg.channels.discord.clone() {
        let adapter = channels::discord::DiscordAdapter::new(dc_config);
        adapter.start(raw_tx.clone()).await?;
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(adapter);
        adapter_map.insert(adapter.name().to_string(), adapter);
    }
    if let Some(sl_config) = cfg.channels.slack.clone() {
        let adapter = channels::slack::SlackAdapter::new(sl_config);
        adapter.start(raw_tx.clone()).await?;
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(adapter);
        adapter_map.insert(adapter.name().to_string(), adapter);
    }
    if adapter_map.is_empty() {
        anyhow::bail!("no channels configured — add channels.telegram, channels.discord, or channels.slack");
    }

    // Cron/board/reminders notify through whichever channel+session the
    // config points at; unaddressed notifications are dropped rather than
    // guessed at.
    let notify_channels: Vec<Box<dyn notify::OutboundChannel>> = match (&cfg.notify.channel, &cfg.notify.session_id) {
        (Some(channel_name), Some(session_id)) => adapter_map
            .get(channel_name)
            .map(|adapter| Box::new(notify::ChannelOutbound::new(adapter.clone(), session_id.clone())) as Box<dyn notify::OutboundChannel>)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    };

    let ctx = Arc::new(setup::DaemonContext::build(db.clone(), cfg.clone(), notify_channels));
    let adapters = Arc::new(adapter_map);

    let cancel = tokio_util::sync::CancellationToken::new();

    ctx.cron.clone().spawn(cancel.clone());
    ctx.board.clone().spawn(cancel.clone());
    ctx.reminders.clone().spawn(cancel.clone());
    watcher::spawn(store.clone(), config_path.to_path_buf(), ctx.trust.clone(), cancel.clone());

    let (event_tx, _) = tokio::sync::broadcast::channel::<web::SseEvent>(256);
    if cfg.web.enabled {
        let state = web::AppState { ctx: ctx.clone(), config: cfg.clone(), adapters: adapters.clone(), event_tx: event_tx.clone() };
        let web_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = web::start_server(state, web_cancel).await {
                tracing::error!(%err, "web server exited");
            }
        });
    }

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    tracing::info!("tetora running, waiting for messages");

    while let Some(incoming) = coalesced_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        let adapter = adapters.get(&incoming.channel).cloned();
        let decision = ctx.router.route(&incoming.content, &incoming.channel).await;
        tracing::info!(agent = %decision.agent, method = ?decision.method, channel = %incoming.channel, "routed inbound message");

        let session = match db.session_get_or_create(&incoming.channel, &incoming.session_id, Some(&decision.agent), None).await {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to open session");
                continue;
            }
        };

        let context = db.session_build_context(session.id, 20).await.unwrap_or_default();
        let prompt = db::session::wrap_with_context(&context, &incoming.content);

        let estimate = ctx.budget.estimate_task(&cfg.agent.default_model, 1000, 1000, decision.method == router::RouteMethod::Llm);
        match ctx.budget.check_hard_budget().await {
            Ok(budget::BudgetDecision::Pause) => {
                tracing::warn!("over budget cap, pausing dispatch");
                ctx.audit.log("budget.pause", &incoming.channel, Some(&format!("session={}", session.id)), None);
                continue;
            }
            Ok(budget::BudgetDecision::WarnAndProceed) => {
                tracing::warn!("over soft budget cap, proceeding with warning");
            }
            _ => {}
        }

        let model = ctx.budget.maybe_downgrade(estimate).unwrap_or(cfg.agent.default_model.as_str()).to_string();

        let mut task = task::Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("{}:{}", incoming.channel, incoming.session_id),
            prompt,
            workdir: cfg.workdir(),
            model,
            provider: None,
            timeout: Duration::from_secs(300),
            budget_usd: Some(estimate),
            permission_mode: "auto".to_string(),
            extra_dirs: vec![],
            source: incoming.channel.clone(),
            system_prompt: cfg.agent.system_prompt.clone(),
            session_id: Some(session.id),
            mcp_bundle: None,
            agent: decision.agent.clone(),
            job_id: None,
        };
        let outcome = ctx.trust.apply(&mut task, &decision.agent);
        if outcome.needs_confirm {
            tracing::info!(agent = %decision.agent, "task requires human confirmation under suggest trust level");
        }

        db.session_add_message(session.id, "user", &incoming.content, None, None, None, None, None).await.ok();

        if ctx.budget.needs_confirmation(estimate) {
            tracing::info!(agent = %decision.agent, estimate, "task held pending budget confirmation");
            ctx.audit.log("budget.confirm_required", &incoming.channel, Some(&format!("agent={} estimate={:.4}", decision.agent, estimate)), None);
            ctx.budget.register_pending(&task.id, estimate);
            ctx.register_pending_dispatch(
                task.id.clone(),
                setup::PendingDispatch { task, channel: incoming.channel.clone(), session_id: incoming.session_id.clone() },
            );
            continue;
        }

        ctx.audit.log("task.dispatch", &incoming.channel, Some(&format!("agent={} session={}", decision.agent, session.id)), None);

        let task_runner = ctx.runner.clone();
        let sender = adapter.clone();
        let outgoing_channel = incoming.channel.clone();
        let outgoing_session = incoming.session_id.clone();
        let audit = ctx.audit.clone();
        let event_tx = event_tx.clone();
        let ctx_held = ctx.clone();
        let held_agent = decision.agent.clone();
        let needs_approval = outcome.needs_confirm;
        let session_compact_high_water = cfg.agent.session_compact_high_water;
        let session_id = task.session_id;
        tokio::spawn(async move {
            let _ = event_tx.send(web::SseEvent::TaskDispatched { task_id: task.id.clone(), agent: task.agent.clone(), source: task.source.clone() });
            match task_runner.run(task).await {
                Ok(result) => {
                    audit.log("task.complete", &outgoing_channel, Some(&format!("status={:?}", result.status)), None);
                    let _ = event_tx.send(web::SseEvent::TaskComplete { task_id: result.task_id.clone(), status: format!("{:?}", result.status), cost_usd: result.cost_usd });
                    if needs_approval {
                        ctx_held.hold_result(
                            result.task_id.clone(),
                            setup::HeldResult {
                                agent: held_agent,
                                channel: outgoing_channel.clone(),
                                session_id: outgoing_session.clone(),
                                output: result.output.clone(),
                            },
                        );
                        audit.log("task.held", &outgoing_channel, Some(&format!("task_id={}", result.task_id)), None);
                    } else if let Some(adapter) = sender {
                        let outgoing = channels::OutgoingMessage {
                            channel: outgoing_channel,
                            session_id: outgoing_session,
                            content: result.output,
                            reply_to: None,
                        };
                        if let Err(err) = adapter.send(outgoing).await {
                            tracing::error!(%err, "failed to deliver response");
                        }
                    }
                    if let Some(session_id) = session_id {
                        task_runner.maybe_compact_session(session_id, session_compact_high_water).await;
                    }
                }
                Err(err) => {
                    audit.log("task.error", &outgoing_channel, Some(&err.to_string()), None);
                    tracing::error!(%err, "task run failed");
                }
            }
        });
    }

    Ok(())
}
