//! Prompt template variable expansion (spec §6): the exact recognized set is
//! `{{date}}`, `{{weekday}}`, `{{env.NAME}}`, `{{last_output}}`,
//! `{{last_prompt}}`, `{{last_time}}`, `{{knowledge:QUERY}}`. Anything else
//! inside `{{…}}` is left verbatim.

use chrono::Local;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Per-job state consulted for `{{last_output}}` / `{{last_prompt}}` /
/// `{{last_time}}`; empty when the job id is unknown.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    pub last_output: String,
    pub last_prompt: String,
    pub last_time: String,
}

/// External leaf: only `search(query)` is consumed for `{{knowledge:Q}}`.
pub trait KnowledgeSearch {
    fn search(&self, query: &str) -> String;
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").unwrap())
}

/// Expand recognized template variables in `prompt`. `job_state` is looked
/// up by `job_id` when present; `knowledge` backs `{{knowledge:Q}}`.
pub fn expand(
    prompt: &str,
    job_id: Option<&str>,
    job_states: &HashMap<String, JobState>,
    knowledge: Option<&dyn KnowledgeSearch>,
) -> String {
    let empty = JobState::default();
    let state = job_id.and_then(|id| job_states.get(id)).unwrap_or(&empty);

    placeholder_re()
        .replace_all(prompt, |caps: &regex::Captures| {
            let inner = &caps[1];
            if inner == "date" {
                Local::now().format("%Y-%m-%d").to_string()
            } else if inner == "weekday" {
                Local::now().format("%A").to_string()
            } else if let Some(name) = inner.strip_prefix("env.") {
                std::env::var(name).unwrap_or_default()
            } else if inner == "last_output" {
                state.last_output.clone()
            } else if inner == "last_prompt" {
                state.last_prompt.clone()
            } else if inner == "last_time" {
                state.last_time.clone()
            } else if let Some(query) = inner.strip_prefix("knowledge:") {
                match knowledge {
                    Some(k) => k.search(query),
                    None => String::new(),
                }
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubKnowledge;
    impl KnowledgeSearch for StubKnowledge {
        fn search(&self, query: &str) -> String {
            format!("[snippet for {query}]")
        }
    }

    #[test]
    fn test_env_and_unknown_placeholder() {
        std::env::set_var("FOO", "bar");
        let out = expand("Today {{date}} env={{env.FOO}} unknown={{xyz}}", None, &HashMap::new(), None);
        assert!(out.contains("env=bar"));
        assert!(out.contains("unknown={{xyz}}"));
        assert!(out.starts_with("Today "));
    }

    #[test]
    fn test_unset_env_var_expands_empty() {
        std::env::remove_var("DOES_NOT_EXIST_TETORA");
        let out = expand("{{env.DOES_NOT_EXIST_TETORA}}", None, &HashMap::new(), None);
        assert_eq!(out, "");
    }

    #[test]
    fn test_job_state_lookup() {
        let mut states = HashMap::new();
        states.insert(
            "job-1".to_string(),
            JobState {
                last_output: "42".to_string(),
                last_prompt: "what is it".to_string(),
                last_time: "2026-01-01T00:00:00Z".to_string(),
            },
        );
        let out = expand("prev={{last_output}}", Some("job-1"), &states, None);
        assert_eq!(out, "prev=42");
    }

    #[test]
    fn test_unknown_job_id_expands_empty() {
        let out = expand("prev={{last_output}}", Some("nonexistent"), &HashMap::new(), None);
        assert_eq!(out, "prev=");
    }

    #[test]
    fn test_knowledge_placeholder() {
        let out = expand("see {{knowledge:rust async}}", None, &HashMap::new(), Some(&StubKnowledge));
        assert_eq!(out, "see [snippet for rust async]");
    }
}
