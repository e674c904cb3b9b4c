//! Keyword-based role matching for task placement.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::TaskSpec;

/// Specialization a worker can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Backend,
    Frontend,
    Database,
    Testing,
    Documentation,
    Infrastructure,
    Security,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Backend,
        Role::Frontend,
        Role::Database,
        Role::Testing,
        Role::Documentation,
        Role::Infrastructure,
        Role::Security,
    ];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Backend => "backend",
            Role::Frontend => "frontend",
            Role::Database => "database",
            Role::Testing => "testing",
            Role::Documentation => "documentation",
            Role::Infrastructure => "infrastructure",
            Role::Security => "security",
        };
        write!(f, "{}", s)
    }
}

/// Regex for lowercase alphanumeric words
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

/// Lowercased distinct words of `text`.
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() > 1)
        .collect()
}

/// Keywords of a task: title, description and tags.
pub fn task_keywords(task: &TaskSpec) -> BTreeSet<String> {
    let mut keywords = extract_keywords(&task.title);
    keywords.extend(extract_keywords(&task.description));
    for tag in &task.tags {
        keywords.extend(extract_keywords(tag));
    }
    keywords
}

/// Keyword vocabulary per role.
#[derive(Debug, Clone)]
pub struct Theme {
    keywords: BTreeMap<Role, BTreeSet<String>>,
}

impl Theme {
    pub fn new() -> Self {
        Self {
            keywords: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: Role, words: &[&str]) -> Self {
        self.keywords
            .entry(role)
            .or_default()
            .extend(words.iter().map(|w| w.to_lowercase()));
        self
    }

    pub fn keywords(&self, role: Role) -> Option<&BTreeSet<String>> {
        self.keywords.get(&role)
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self::new()
            .with_role(
                Role::Backend,
                &["api", "server", "endpoint", "handler", "service", "route", "routes", "auth", "middleware"],
            )
            .with_role(
                Role::Frontend,
                &["ui", "component", "page", "css", "react", "view", "layout", "button", "form"],
            )
            .with_role(
                Role::Database,
                &["database", "schema", "migration", "sql", "query", "model", "table", "index"],
            )
            .with_role(
                Role::Testing,
                &["test", "tests", "spec", "fixture", "coverage", "e2e", "integration"],
            )
            .with_role(
                Role::Documentation,
                &["doc", "docs", "readme", "documentation", "guide", "changelog"],
            )
            .with_role(
                Role::Infrastructure,
                &["deploy", "docker", "ci", "pipeline", "terraform", "kubernetes", "config"],
            )
            .with_role(
                Role::Security,
                &["security", "secret", "encryption", "permission", "token", "csrf", "xss"],
            )
    }
}

/// Scores keywords against a theme.
#[derive(Debug, Clone, Default)]
pub struct RoleMatcher {
    theme: Theme,
}

impl RoleMatcher {
    pub fn new(theme: Theme) -> Self {
        Self { theme }
    }

    /// Number of theme keywords for `role` present in `keywords`.
    pub fn score(&self, role: Role, keywords: &BTreeSet<String>) -> usize {
        self.theme
            .keywords(role)
            .map(|words| words.intersection(keywords).count())
            .unwrap_or(0)
    }

    /// Highest-scoring role; ties go to the earlier role in [`Role::ALL`].
    pub fn match_role(&self, keywords: &BTreeSet<String>) -> Option<Role> {
        let mut best: Option<(Role, usize)> = None;
        for role in Role::ALL {
            let score = self.score(role, keywords);
            if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((role, score));
            }
        }
        best.map(|(role, _)| role)
    }

    pub fn match_task(&self, task: &TaskSpec) -> Option<Role> {
        self.match_role(&task_keywords(task))
    }
}
