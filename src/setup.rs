//! Wires the standalone subsystems (trust, budget, router, audit, cron,
//! board, reminders) into one `DaemonContext` the daemon loop and CLI job
//! commands share. Kept separate from `main.rs` so the wiring itself is
//! testable without booting channel adapters or the web server.

use crate::audit::AuditWriter;
use crate::board::BoardDispatcher;
use crate::budget::{BudgetGate, ModelRate, OverBudgetAction, RateCard};
use crate::config::Config;
use crate::cron::CronEngine;
use crate::db::Db;
use crate::notify::{MultiNotifier, Notifier, OutboundChannel};
use crate::reminders::ReminderEngine;
use crate::router::{Router, SubprocessClassifier};
use crate::runner::{SubprocessProvider, TaskRunner};
use crate::task::Task;
use crate::trust::{TrustLevel, TrustRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A completed task output held back from delivery pending explicit human
/// approval (`suggest` trust level, C3).
pub struct HeldResult {
    pub agent: String,
    pub channel: String,
    pub session_id: String,
    pub output: String,
}

/// A built, not-yet-run task held back pending budget confirmation (C5's
/// `confirmation_threshold_usd`).
pub struct PendingDispatch {
    pub task: Task,
    pub channel: String,
    pub session_id: String,
}

/// Everything the daemon's main loop and CLI job commands dispatch through.
pub struct DaemonContext {
    pub db: Db,
    pub runner: TaskRunner,
    pub router: Router,
    pub trust: Arc<TrustRegistry>,
    pub budget: Arc<BudgetGate>,
    pub audit: Arc<AuditWriter>,
    pub notifier: Arc<dyn Notifier>,
    pub cron: Arc<CronEngine>,
    pub board: Arc<BoardDispatcher>,
    pub reminders: Arc<ReminderEngine>,
    pub held_results: Mutex<HashMap<String, HeldResult>>,
    pub pending_dispatch: Mutex<HashMap<String, PendingDispatch>>,
}

impl DaemonContext {
    /// Park a `suggest`-level task's output; returns the id the approval
    /// surface uses to reference it.
    pub fn hold_result(&self, id: String, held: HeldResult) {
        self.held_results.lock().unwrap().insert(id, held);
    }

    /// Approve a held result for delivery, removing it from the hold set.
    pub fn approve_held(&self, id: &str) -> Option<HeldResult> {
        self.held_results.lock().unwrap().remove(id)
    }

    /// Reject a held result, discarding it without delivery.
    pub fn reject_held(&self, id: &str) -> bool {
        self.held_results.lock().unwrap().remove(id).is_some()
    }

    pub fn list_held(&self) -> Vec<String> {
        self.held_results.lock().unwrap().keys().cloned().collect()
    }

    pub fn register_pending_dispatch(&self, id: String, pending: PendingDispatch) {
        self.pending_dispatch.lock().unwrap().insert(id, pending);
    }

    /// Approve a held dispatch for execution, removing it from the pending set.
    pub fn take_pending_dispatch(&self, id: &str) -> Option<PendingDispatch> {
        self.pending_dispatch.lock().unwrap().remove(id)
    }

    pub fn list_pending_dispatch(&self) -> Vec<String> {
        self.pending_dispatch.lock().unwrap().keys().cloned().collect()
    }
}

fn rate_card(cfg: &Config) -> RateCard {
    let per_model = cfg
        .budget
        .per_model
        .iter()
        .map(|(model, rate)| (model.clone(), ModelRate { input_per_1k: rate.input_per_1k, output_per_1k: rate.output_per_1k }))
        .collect();
    RateCard { per_model, classification_cost: cfg.budget.classification_cost, default_rate: ModelRate::default() }
}

fn over_budget_action(cfg: &Config) -> OverBudgetAction {
    match cfg.budget.over_budget_action.as_str() {
        "pause" => OverBudgetAction::Pause,
        _ => OverBudgetAction::Warn,
    }
}

impl DaemonContext {
    pub fn build(db: Db, cfg: Arc<Config>, notify_channels: Vec<Box<dyn OutboundChannel>>) -> Self {
        let provider = Arc::new(SubprocessProvider { default_binary: cfg.agent.binary.clone() });
        let runner = TaskRunner::new(db.clone(), provider, cfg.agent.max_concurrent);

        let trust = Arc::new(TrustRegistry::new(db.clone(), cfg.trust.enabled, cfg.trust.promotion_threshold));
        let levels: std::collections::HashMap<String, TrustLevel> = cfg
            .trust
            .levels
            .iter()
            .filter_map(|(agent, level)| TrustLevel::parse(level).map(|l| (agent.clone(), l)))
            .collect();
        trust.set_levels(levels);

        let known_agents: Vec<String> = if cfg.trust.levels.is_empty() {
            vec!["ask".to_string()]
        } else {
            cfg.trust.levels.keys().cloned().collect()
        };
        let default_agent = known_agents[0].clone();

        let classifier = SubprocessClassifier::new(runner.clone(), cfg.agent.default_model.clone(), known_agents, default_agent.clone());
        let router = Router::new(std::collections::HashMap::new(), default_agent).with_classifier(Box::new(classifier));

        let budget = Arc::new(BudgetGate::new(
            db.clone(),
            rate_card(&cfg),
            cfg.budget.confirmation_threshold_usd,
            cfg.budget.daily_cap_usd,
            cfg.budget.weekly_cap_usd,
            cfg.budget.monthly_cap_usd,
            over_budget_action(&cfg),
            cfg.budget.downgrade_threshold_usd,
            cfg.budget.warning_threshold_usd,
            cfg.budget.downgrade_model.clone(),
        ));

        let audit = Arc::new(AuditWriter::spawn(db.clone()));

        let notifier: Arc<dyn Notifier> = Arc::new(MultiNotifier::new(notify_channels, quiet_hours(&cfg)));

        let cron = Arc::new(CronEngine::new(db.clone(), runner.clone(), Some(notifier.clone()), audit.clone(), cfg.workdir(), cfg.agent.default_model.clone()));
        let board = Arc::new(BoardDispatcher::new(db.clone(), runner.clone(), Duration::from_secs(10), cfg.agent.default_model.clone(), cfg.workdir()));
        let reminders = Arc::new(ReminderEngine::new(db.clone(), notifier.clone()));

        Self {
            db,
            runner,
            router,
            trust,
            budget,
            audit,
            notifier,
            cron,
            board,
            reminders,
            held_results: Mutex::new(HashMap::new()),
            pending_dispatch: Mutex::new(HashMap::new()),
        }
    }
}

fn quiet_hours(cfg: &Config) -> Option<crate::notify::QuietHours> {
    let start = cfg.notify.quiet_hours_start.as_deref()?;
    let end = cfg.notify.quiet_hours_end.as_deref()?;
    let start = chrono::NaiveTime::parse_from_str(start, "%H:%M").ok()?;
    let end = chrono::NaiveTime::parse_from_str(end, "%H:%M").ok()?;
    Some(crate::notify::QuietHours { start, end })
}
