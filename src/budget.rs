//! Budget/estimate gate (C5): pre-dispatch cost estimation, confirmation
//! prompts for expensive requests, hard daily/weekly/monthly caps with a
//! cached spend lookup, and auto-downgrade to a cheaper model.

use crate::db::{Db, DbError};
use chrono::{Datelike, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SPEND_CACHE_TTL: Duration = Duration::from_secs(30);
pub const PENDING_ESTIMATE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RateCard {
    pub per_model: HashMap<String, ModelRate>,
    /// Flat cost added when the router's classifier pass was used.
    pub classification_cost: f64,
    pub default_rate: ModelRate,
}

impl Default for ModelRate {
    fn default() -> Self {
        ModelRate {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverBudgetAction {
    Pause,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Proceed,
    /// Over cap with action=pause: dispatch must be refused.
    Pause,
    /// Over cap with action=warn: dispatch proceeds; caller should notify
    /// once per transition into over-budget (tracked by the caller).
    WarnAndProceed,
}

struct SpendCache {
    computed_at: Instant,
    today: f64,
    week: f64,
    month: f64,
}

struct PendingConfirmation {
    estimate_usd: f64,
    created_at: Instant,
}

pub struct BudgetGate {
    db: Db,
    rate_card: RateCard,
    confirmation_threshold_usd: f64,
    daily_cap: Option<f64>,
    weekly_cap: Option<f64>,
    monthly_cap: Option<f64>,
    over_budget_action: OverBudgetAction,
    downgrade_threshold_usd: f64,
    warning_threshold_usd: f64,
    downgrade_model: String,
    spend_cache: Mutex<Option<SpendCache>>,
    pending: Mutex<HashMap<String, PendingConfirmation>>,
}

impl BudgetGate {
    pub fn new(
        db: Db,
        rate_card: RateCard,
        confirmation_threshold_usd: f64,
        daily_cap: Option<f64>,
        weekly_cap: Option<f64>,
        monthly_cap: Option<f64>,
        over_budget_action: OverBudgetAction,
        downgrade_threshold_usd: f64,
        warning_threshold_usd: f64,
        downgrade_model: String,
    ) -> Self {
        Self {
            db,
            rate_card,
            confirmation_threshold_usd,
            daily_cap,
            weekly_cap,
            monthly_cap,
            over_budget_action,
            downgrade_threshold_usd,
            warning_threshold_usd,
            downgrade_model,
            spend_cache: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Pure function: projected cost of one task given model + token estimate.
    pub fn estimate_task(&self, model: &str, tokens_in: u64, tokens_out: u64, used_router: bool) -> f64 {
        let rate = self.rate_card.per_model.get(model).unwrap_or(&self.rate_card.default_rate);
        let mut cost = (tokens_in as f64 / 1000.0) * rate.input_per_1k + (tokens_out as f64 / 1000.0) * rate.output_per_1k;
        if used_router {
            cost += self.rate_card.classification_cost;
        }
        cost
    }

    /// Sum of `estimate_task` over a batch.
    pub fn estimate_batch(&self, tasks: &[(&str, u64, u64, bool)]) -> f64 {
        tasks
            .iter()
            .map(|(model, tin, tout, router)| self.estimate_task(model, *tin, *tout, *router))
            .sum()
    }

    pub fn needs_confirmation(&self, estimate_usd: f64) -> bool {
        estimate_usd > self.confirmation_threshold_usd
    }

    /// Park an estimate awaiting human confirm/reject; lazily swept on next
    /// touch rather than via a dedicated sweeper (per design note).
    pub fn register_pending(&self, id: &str, estimate_usd: f64) {
        self.pending.lock().unwrap().insert(
            id.to_string(),
            PendingConfirmation {
                estimate_usd,
                created_at: Instant::now(),
            },
        );
    }

    /// Resolve a pending confirmation. Returns `None` if unknown or expired.
    pub fn take_pending(&self, id: &str) -> Option<f64> {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(id) {
            Some(entry) if entry.created_at.elapsed() < PENDING_ESTIMATE_TTL => Some(entry.estimate_usd),
            _ => None,
        }
    }

    async fn refresh_spend_cache(&self) -> Result<(), DbError> {
        let today_start = today_start_ms();
        let week_start = week_start_ms();
        let month_start = month_start_ms();
        let today = self.db.history_cost_since(today_start, None, None).await?;
        let week = self.db.history_cost_since(week_start, None, None).await?;
        let month = self.db.history_cost_since(month_start, None, None).await?;
        *self.spend_cache.lock().unwrap() = Some(SpendCache {
            computed_at: Instant::now(),
            today,
            week,
            month,
        });
        Ok(())
    }

    fn cached_spend_if_fresh(&self) -> Option<(f64, f64, f64)> {
        let cache = self.spend_cache.lock().unwrap();
        cache
            .as_ref()
            .filter(|c| c.computed_at.elapsed() < SPEND_CACHE_TTL)
            .map(|c| (c.today, c.week, c.month))
    }

    /// Check `(today, this_week, this_month)` spend against configured caps.
    pub async fn check_hard_budget(&self) -> Result<BudgetDecision, DbError> {
        let (today, week, month) = match self.cached_spend_if_fresh() {
            Some(v) => v,
            None => {
                self.refresh_spend_cache().await?;
                self.cached_spend_if_fresh().unwrap()
            }
        };
        let over = self.daily_cap.is_some_and(|c| today > c)
            || self.weekly_cap.is_some_and(|c| week > c)
            || self.monthly_cap.is_some_and(|c| month > c);
        if !over {
            return Ok(BudgetDecision::Proceed);
        }
        Ok(match self.over_budget_action {
            OverBudgetAction::Pause => BudgetDecision::Pause,
            OverBudgetAction::Warn => BudgetDecision::WarnAndProceed,
        })
    }

    /// `Some(cheaper_model)` when projected cost sits strictly between the
    /// downgrade and warning thresholds.
    pub fn maybe_downgrade(&self, projected_cost: f64) -> Option<&str> {
        if projected_cost > self.downgrade_threshold_usd && projected_cost <= self.warning_threshold_usd {
            Some(&self.downgrade_model)
        } else {
            None
        }
    }

    /// `(today, week, month)` spend plus configured caps, refreshing the
    /// cache if stale. Backs the web dashboard's budget status endpoint.
    pub async fn spend_snapshot(&self) -> Result<((f64, f64, f64), (Option<f64>, Option<f64>, Option<f64>)), DbError> {
        let spend = match self.cached_spend_if_fresh() {
            Some(v) => v,
            None => {
                self.refresh_spend_cache().await?;
                self.cached_spend_if_fresh().unwrap()
            }
        };
        Ok((spend, (self.daily_cap, self.weekly_cap, self.monthly_cap)))
    }
}

fn today_start_ms() -> u64 {
    let now = Utc::now();
    now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis() as u64
}

fn week_start_ms() -> u64 {
    let now = Utc::now();
    let days_since_monday = now.weekday().num_days_from_monday();
    let monday = now.date_naive() - chrono::Duration::days(days_since_monday as i64);
    monday.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis() as u64
}

fn month_start_ms() -> u64 {
    let now = Utc::now();
    now.date_naive()
        .with_day(1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(db: Db) -> BudgetGate {
        let mut per_model = HashMap::new();
        per_model.insert(
            "gpt-5".to_string(),
            ModelRate {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
            },
        );
        let rate_card = RateCard {
            per_model,
            classification_cost: 0.001,
            default_rate: ModelRate::default(),
        };
        BudgetGate::new(
            db,
            rate_card,
            1.0,
            Some(10.0),
            Some(50.0),
            Some(200.0),
            OverBudgetAction::Pause,
            0.5,
            2.0,
            "gpt-5-mini".to_string(),
        )
    }

    #[test]
    fn test_estimate_task_applies_rate_card() {
        let db = Db::open_memory().unwrap();
        let gate = gate(db);
        let cost = gate.estimate_task("gpt-5", 1000, 1000, false);
        assert!((cost - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_adds_classification_cost_when_routed() {
        let db = Db::open_memory().unwrap();
        let gate = gate(db);
        let routed = gate.estimate_task("gpt-5", 0, 0, true);
        assert!((routed - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_needs_confirmation_threshold() {
        let db = Db::open_memory().unwrap();
        let gate = gate(db);
        assert!(!gate.needs_confirmation(0.99));
        assert!(gate.needs_confirmation(1.01));
    }

    #[test]
    fn test_pending_confirmation_roundtrip() {
        let db = Db::open_memory().unwrap();
        let gate = gate(db);
        gate.register_pending("req-1", 5.0);
        assert_eq!(gate.take_pending("req-1"), Some(5.0));
        // Consumed: a second take sees nothing.
        assert_eq!(gate.take_pending("req-1"), None);
    }

    #[test]
    fn test_downgrade_band() {
        let db = Db::open_memory().unwrap();
        let gate = gate(db);
        assert_eq!(gate.maybe_downgrade(0.3), None);
        assert_eq!(gate.maybe_downgrade(1.0), Some("gpt-5-mini"));
        assert_eq!(gate.maybe_downgrade(3.0), None);
    }

    #[tokio::test]
    async fn test_hard_budget_proceeds_under_cap() {
        let db = Db::open_memory().unwrap();
        let gate = gate(db);
        assert_eq!(gate.check_hard_budget().await.unwrap(), BudgetDecision::Proceed);
    }

    #[tokio::test]
    async fn test_hard_budget_pauses_over_daily_cap() {
        let db = Db::open_memory().unwrap();
        db.history_insert(crate::db::history::HistoryInsert {
            task_id: "t",
            name: "n",
            source: "ask",
            agent: "writer",
            task_json: "{}",
            status: "success",
            exit_code: Some(0),
            output: None,
            error: None,
            cost_usd: 20.0,
            tokens_in: 0,
            tokens_out: 0,
            model_used: Some("gpt-5"),
            duration_ms: 1,
            session_id: None,
            output_file: None,
            started_at: crate::db::now_ms(),
            finished_at: None,
        })
        .await
        .unwrap();
        let gate = gate(db);
        assert_eq!(gate.check_hard_budget().await.unwrap(), BudgetDecision::Pause);
    }
}
