//! Charter audit of completion summaries.
//!
//! The charter is a markdown document. Bullet points under a heading named
//! "Core Principles" are the rules; everything else is ignored.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Heading that opens the principles section.
const PRINCIPLES_HEADING: &str = "core principles";

/// Keyword in a principle and the words that satisfy it in a summary.
const REQUIREMENTS: &[(&[&str], &[&str], &str)] = &[
    (&["test"], &["test"], "tests"),
    (&["document", "doc"], &["document", "doc"], "documentation"),
    (&["type"], &["type"], "types"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharterEnforcer {
    principles: Vec<String>,
}

impl CharterEnforcer {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Charter(format!("Cannot read {}: {}", path.display(), e)))?;
        let enforcer = Self::from_markdown(&content);
        debug!(
            path = %path.display(),
            principles = enforcer.principles.len(),
            "Charter loaded"
        );
        Ok(enforcer)
    }

    pub fn from_markdown(content: &str) -> Self {
        let mut principles = Vec::new();
        let mut in_section = false;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                let title = trimmed.trim_start_matches('#').trim().to_lowercase();
                in_section = title == PRINCIPLES_HEADING;
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some(bullet) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            {
                let bullet = bullet.trim();
                if !bullet.is_empty() {
                    principles.push(bullet.to_string());
                }
            }
        }
        Self { principles }
    }

    pub fn principles(&self) -> &[String] {
        &self.principles
    }

    /// Check a completion summary against every principle.
    ///
    /// Returns whether it complies and, if not, every unmet principle
    /// joined with "; ".
    pub fn audit_completion(&self, summary: &str) -> (bool, String) {
        let summary = summary.to_lowercase();
        let unmet: Vec<String> = self
            .principles
            .iter()
            .filter_map(|principle| {
                let lower = principle.to_lowercase();
                REQUIREMENTS
                    .iter()
                    .find(|(triggers, satisfied_by, _)| {
                        triggers.iter().any(|t| lower.contains(t))
                            && !satisfied_by.iter().any(|s| summary.contains(s))
                    })
                    .map(|(_, _, what)| {
                        format!("\"{}\" requires {} but the summary never mentions them", principle, what)
                    })
            })
            .collect();

        if unmet.is_empty() {
            (true, "All principles satisfied".to_string())
        } else {
            (false, unmet.join("; "))
        }
    }
}
