//! Router (C6): assigns an agent to an inbound prompt via a keyword
//! heuristic, falling back to an LLM classifier, falling back to a
//! configured default agent.

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    Keyword,
    Llm,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn from_classifier_label(label: &str) -> Confidence {
        match label.to_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub agent: String,
    pub method: RouteMethod,
    pub confidence: Confidence,
}

/// What the classifier pass returns. Classification is itself a dispatched
/// Task (subject to concurrency/budget/timeout gates) — the router only
/// knows how to interpret the result, not how to run a subprocess.
pub struct ClassifierOutput {
    pub agent: String,
    pub confidence_label: String,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &str) -> anyhow::Result<ClassifierOutput>;
}

/// Runs the classification prompt through the task runner itself, so a
/// classifier pass is subject to the same concurrency/budget/timeout gates
/// as any other task. Expects the model to answer on one line as
/// `AGENT: confidence` (e.g. `coder: high`).
pub struct SubprocessClassifier {
    runner: crate::runner::TaskRunner,
    model: String,
    known_agents: Vec<String>,
    default_agent: String,
}

impl SubprocessClassifier {
    pub fn new(runner: crate::runner::TaskRunner, model: String, known_agents: Vec<String>, default_agent: String) -> Self {
        Self { runner, model, known_agents, default_agent }
    }

    fn build_prompt(&self, prompt: &str) -> String {
        format!(
            "Classify which agent should handle this request. Agents: {}. \
             Respond on one line as \"agent: confidence\" where confidence is low, medium, or high.\n\nRequest: {}",
            self.known_agents.join(", "),
            prompt
        )
    }

    fn parse_output(&self, output: &str) -> ClassifierOutput {
        for line in output.lines() {
            if let Some((agent, confidence)) = line.split_once(':') {
                let agent = agent.trim().to_lowercase();
                if self.known_agents.iter().any(|a| a.to_lowercase() == agent) {
                    return ClassifierOutput { agent, confidence_label: confidence.trim().to_string() };
                }
            }
        }
        ClassifierOutput { agent: self.default_agent.clone(), confidence_label: "low".to_string() }
    }
}

#[async_trait]
impl Classifier for SubprocessClassifier {
    async fn classify(&self, prompt: &str) -> anyhow::Result<ClassifierOutput> {
        let task = crate::task::Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: "classify".to_string(),
            prompt: self.build_prompt(prompt),
            workdir: std::env::temp_dir(),
            model: self.model.clone(),
            provider: None,
            timeout: std::time::Duration::from_secs(30),
            budget_usd: None,
            permission_mode: "plan".to_string(),
            extra_dirs: vec![],
            source: "router".to_string(),
            system_prompt: None,
            session_id: None,
            mcp_bundle: None,
            agent: "router".to_string(),
            job_id: None,
        };
        let result = self.runner.run(task).await?;
        Ok(self.parse_output(&result.output))
    }
}

pub struct Router {
    /// agent -> configured keyword set.
    keyword_sets: HashMap<String, Vec<String>>,
    default_agent: String,
    classifier: Option<Box<dyn Classifier>>,
}

impl Router {
    pub fn new(keyword_sets: HashMap<String, Vec<String>>, default_agent: String) -> Self {
        Self {
            keyword_sets,
            default_agent,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Count keyword hits per agent and return the best match, if any,
    /// sorted by `(hits desc, agent name asc)`.
    fn keyword_pass(&self, prompt: &str) -> Option<String> {
        let lower = prompt.to_lowercase();
        let mut scored: Vec<(String, usize)> = self
            .keyword_sets
            .iter()
            .map(|(agent, keywords)| {
                let hits = keywords.iter().filter(|kw| lower.contains(&kw.to_lowercase())).count();
                (agent.clone(), hits)
            })
            .filter(|(_, hits)| *hits > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().next().map(|(agent, _)| agent)
    }

    pub async fn route(&self, prompt: &str, _source: &str) -> RouteDecision {
        if let Some(agent) = self.keyword_pass(prompt) {
            return RouteDecision {
                agent,
                method: RouteMethod::Keyword,
                confidence: Confidence::High,
            };
        }

        if let Some(classifier) = &self.classifier {
            if let Ok(result) = classifier.classify(prompt).await {
                return RouteDecision {
                    agent: result.agent,
                    method: RouteMethod::Llm,
                    confidence: Confidence::from_classifier_label(&result.confidence_label),
                };
            }
        }

        RouteDecision {
            agent: self.default_agent.clone(),
            method: RouteMethod::Default,
            confidence: Confidence::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        let mut sets = HashMap::new();
        sets.insert("coder".to_string(), vec!["code".to_string(), "bug".to_string(), "rust".to_string()]);
        sets.insert("writer".to_string(), vec!["essay".to_string(), "draft".to_string()]);
        Router::new(sets, "ask".to_string())
    }

    #[tokio::test]
    async fn test_keyword_pass_picks_highest_hit_count() {
        let router = router();
        let decision = router.route("there's a bug in my rust code", "telegram").await;
        assert_eq!(decision.agent, "coder");
        assert_eq!(decision.method, RouteMethod::Keyword);
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn test_keyword_tie_break_is_alphabetical() {
        let mut sets = HashMap::new();
        sets.insert("zebra".to_string(), vec!["x".to_string()]);
        sets.insert("alpha".to_string(), vec!["x".to_string()]);
        let router = Router::new(sets, "ask".to_string());
        let decision = router.route("x", "cli").await;
        assert_eq!(decision.agent, "alpha");
    }

    #[tokio::test]
    async fn test_falls_back_to_default_without_classifier() {
        let router = router();
        let decision = router.route("what's the weather", "cli").await;
        assert_eq!(decision.agent, "ask");
        assert_eq!(decision.method, RouteMethod::Default);
        assert_eq!(decision.confidence, Confidence::Low);
    }

    struct StubClassifier;
    #[async_trait]
    impl Classifier for StubClassifier {
        async fn classify(&self, _prompt: &str) -> anyhow::Result<ClassifierOutput> {
            Ok(ClassifierOutput {
                agent: "researcher".to_string(),
                confidence_label: "medium".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_classifier_pass_used_when_no_keyword_match() {
        let router = router().with_classifier(Box::new(StubClassifier));
        let decision = router.route("tell me about quantum physics", "cli").await;
        assert_eq!(decision.agent, "researcher");
        assert_eq!(decision.method, RouteMethod::Llm);
        assert_eq!(decision.confidence, Confidence::Medium);
    }
}
