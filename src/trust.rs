//! Trust registry (C3): per-agent policy governing whether task output is
//! auto-applied, human-approved, or observe-only.

use crate::db::Db;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Observe,
    Suggest,
    Auto,
}

impl TrustLevel {
    /// `observe -> 0, suggest -> 1, auto -> 2`.
    pub fn index(self) -> u8 {
        match self {
            TrustLevel::Observe => 0,
            TrustLevel::Suggest => 1,
            TrustLevel::Auto => 2,
        }
    }

    pub fn next(self) -> TrustLevel {
        match self {
            TrustLevel::Observe => TrustLevel::Suggest,
            TrustLevel::Suggest => TrustLevel::Auto,
            TrustLevel::Auto => TrustLevel::Auto,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Observe => "observe",
            TrustLevel::Suggest => "suggest",
            TrustLevel::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<TrustLevel> {
        match s {
            "observe" => Some(TrustLevel::Observe),
            "suggest" => Some(TrustLevel::Suggest),
            "auto" => Some(TrustLevel::Auto),
            _ => None,
        }
    }
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::Auto
    }
}

/// Result of applying a trust level to a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub level: TrustLevel,
    pub needs_confirm: bool,
}

/// Published over the HTTP/status surface after `promotion_readiness`.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionStatus {
    pub agent: String,
    pub level: TrustLevel,
    pub consecutive_success: u32,
    pub threshold: u32,
    pub ready: bool,
}

/// Anything that can have a permission mode forced read-only. Kept minimal
/// so `trust::apply` doesn't need to know about the full `Task` shape.
pub trait PermissionMutable {
    fn force_plan_mode(&mut self);
}

pub struct TrustRegistry {
    db: Db,
    enabled: bool,
    promotion_threshold: u32,
    levels: RwLock<HashMap<String, TrustLevel>>,
}

impl TrustRegistry {
    pub fn new(db: Db, enabled: bool, promotion_threshold: u32) -> Self {
        Self {
            db,
            enabled,
            promotion_threshold,
            levels: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the whole configured agent -> level map (used by config reload).
    pub fn set_levels(&self, levels: HashMap<String, TrustLevel>) {
        *self.levels.write().unwrap() = levels;
    }

    /// `auto` if the subsystem is globally disabled; else the agent's
    /// configured level, defaulting to `auto` when unconfigured.
    pub fn resolve(&self, agent: &str) -> TrustLevel {
        if !self.enabled {
            return TrustLevel::Auto;
        }
        self.levels
            .read()
            .unwrap()
            .get(agent)
            .copied()
            .unwrap_or(TrustLevel::Auto)
    }

    /// Applies the resolved level's policy to a task-like value.
    pub fn apply<T: PermissionMutable>(&self, task: &mut T, agent: &str) -> ApplyOutcome {
        let level = self.resolve(agent);
        match level {
            TrustLevel::Observe => {
                task.force_plan_mode();
                ApplyOutcome {
                    level,
                    needs_confirm: false,
                }
            }
            TrustLevel::Suggest => ApplyOutcome {
                level,
                needs_confirm: true,
            },
            TrustLevel::Auto => ApplyOutcome {
                level,
                needs_confirm: false,
            },
        }
    }

    /// Record an explicit level transition.
    pub async fn set_level(&self, agent: &str, to: TrustLevel, note: Option<&str>) -> Result<(), crate::db::DbError> {
        let from = self.resolve(agent);
        let consecutive = self.db.history_consecutive_successes(agent).await.unwrap_or(0);
        self.levels.write().unwrap().insert(agent.to_string(), to);
        self.db
            .trust_event_insert(agent, "set", from.as_str(), to.as_str(), consecutive as i64, note)
            .await
    }

    /// Scan recent history in reverse-chronological order, counting
    /// successes until the first non-success, and publish a status object.
    pub async fn promotion_readiness(&self, agent: &str) -> Result<PromotionStatus, crate::db::DbError> {
        let consecutive_success = self.db.history_consecutive_successes(agent).await?;
        Ok(PromotionStatus {
            agent: agent.to_string(),
            level: self.resolve(agent),
            consecutive_success,
            threshold: self.promotion_threshold,
            ready: consecutive_success >= self.promotion_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTask {
        permission_mode: String,
    }
    impl PermissionMutable for FakeTask {
        fn force_plan_mode(&mut self) {
            self.permission_mode = "plan".to_string();
        }
    }

    #[tokio::test]
    async fn test_apply_observe_forces_plan_mode() {
        let db = Db::open_memory().unwrap();
        let registry = TrustRegistry::new(db, true, 10);
        registry.set_level("writer", TrustLevel::Observe, None).await.unwrap();

        let mut task = FakeTask {
            permission_mode: "default".to_string(),
        };
        let outcome = registry.apply(&mut task, "writer");
        assert_eq!(task.permission_mode, "plan");
        assert!(!outcome.needs_confirm);
    }

    #[tokio::test]
    async fn test_apply_suggest_needs_confirm_without_mutation() {
        let db = Db::open_memory().unwrap();
        let registry = TrustRegistry::new(db, true, 10);
        registry.set_level("writer", TrustLevel::Suggest, None).await.unwrap();

        let mut task = FakeTask {
            permission_mode: "default".to_string(),
        };
        let outcome = registry.apply(&mut task, "writer");
        assert_eq!(task.permission_mode, "default");
        assert!(outcome.needs_confirm);
    }

    #[tokio::test]
    async fn test_disabled_registry_always_auto() {
        let db = Db::open_memory().unwrap();
        let registry = TrustRegistry::new(db, false, 10);
        registry.set_level("writer", TrustLevel::Observe, None).await.unwrap();
        assert_eq!(registry.resolve("writer"), TrustLevel::Auto);
    }

    #[test]
    fn test_level_index_and_next() {
        assert_eq!(TrustLevel::Observe.index(), 0);
        assert_eq!(TrustLevel::Suggest.index(), 1);
        assert_eq!(TrustLevel::Auto.index(), 2);
        assert_eq!(TrustLevel::Observe.next(), TrustLevel::Suggest);
        assert_eq!(TrustLevel::Auto.next(), TrustLevel::Auto);
    }
}
