//! Knowledge index (out of scope per spec: only `search(query)` is consumed
//! by the prompt expander's `{{knowledge:Q}}` placeholder). This is a thin
//! flat-file note store with a word-overlap ranking, not a TF-IDF engine —
//! the core only depends on it through [`KnowledgeSearch`].

use crate::template::KnowledgeSearch;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NoteFile {
    notes: Vec<Note>,
}

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("note not found: {0}")]
    NotFound(String),
}

pub struct KnowledgeIndex {
    path: PathBuf,
}

impl KnowledgeIndex {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<NoteFile, KnowledgeError> {
        if !self.path.exists() {
            return Ok(NoteFile::default());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&self.path)?)?)
    }

    fn save(&self, file: &NoteFile) -> Result<(), KnowledgeError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Note>, KnowledgeError> {
        Ok(self.load()?.notes)
    }

    pub fn add(&self, id: &str, text: &str) -> Result<(), KnowledgeError> {
        let mut file = self.load()?;
        file.notes.retain(|n| n.id != id);
        file.notes.push(Note { id: id.to_string(), text: text.to_string() });
        self.save(&file)
    }

    pub fn remove(&self, id: &str) -> Result<(), KnowledgeError> {
        let mut file = self.load()?;
        let before = file.notes.len();
        file.notes.retain(|n| n.id != id);
        if file.notes.len() == before {
            return Err(KnowledgeError::NotFound(id.to_string()));
        }
        self.save(&file)
    }

    /// Ranks notes by count of shared lowercased words with the query,
    /// joining the top 3 snippets.
    pub fn search_ranked(&self, query: &str, top_n: usize) -> Vec<Note> {
        let notes = self.load().unwrap_or_default().notes;
        let query_words: Vec<String> = query.to_lowercase().split_whitespace().map(str::to_string).collect();
        let mut scored: Vec<(usize, Note)> = notes
            .into_iter()
            .map(|n| {
                let text_lower = n.text.to_lowercase();
                let score = query_words.iter().filter(|w| text_lower.contains(w.as_str())).count();
                (score, n)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(top_n).map(|(_, n)| n).collect()
    }
}

impl KnowledgeSearch for KnowledgeIndex {
    fn search(&self, query: &str) -> String {
        self.search_ranked(query, 3)
            .into_iter()
            .map(|n| n.text)
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}
