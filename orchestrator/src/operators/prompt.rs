//! Prompt rendering for the operators.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go first
//! (in [`DROP_ORDER`]), then the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::HistoryEntry;

const CREATION_TEMPLATE: &str = include_str!("prompts/creation.md");
const PRIORITIZATION_TEMPLATE: &str = include_str!("prompts/prioritization.md");
const EXECUTION_TEMPLATE: &str = include_str!("prompts/execution.md");
const EVALUATION_TEMPLATE: &str = include_str!("prompts/evaluation.md");

/// Droppable sections, least important first.
pub const DROP_ORDER: [&str; 4] = ["similar", "history", "resolved", "known"];

const TRUNCATION_NOTICE: &str = "\n[truncated]";

const SECTION_SEPARATOR: &str = "\n\n";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

/// Which operator a prompt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    Creation,
    Prioritization,
    Execution,
    Evaluation,
}

impl PromptTemplate {
    fn name(self) -> &'static str {
        match self {
            PromptTemplate::Creation => "creation",
            PromptTemplate::Prioritization => "prioritization",
            PromptTemplate::Execution => "execution",
            PromptTemplate::Evaluation => "evaluation",
        }
    }
}

/// Compact view of a history entry for templates.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub name: String,
    pub status: &'static str,
    pub output: String,
}

impl EntrySummary {
    const OUTPUT_PREVIEW_BYTES: usize = 400;

    pub fn from_entry(entry: &HistoryEntry) -> Self {
        Self {
            name: entry.task.name.clone(),
            status: entry.result.status.as_str(),
            output: preview(entry.result.output.trim(), Self::OUTPUT_PREVIEW_BYTES),
        }
    }

    pub fn from_entries(entries: &[HistoryEntry]) -> Vec<Self> {
        entries.iter().map(Self::from_entry).collect()
    }
}

/// minijinja environment holding the operator templates, plus a byte budget.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl std::fmt::Debug for PromptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptEngine")
            .field("budget_bytes", &self.budget_bytes)
            .finish_non_exhaustive()
    }
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("creation", CREATION_TEMPLATE)
            .context("register creation template")?;
        env.add_template("prioritization", PRIORITIZATION_TEMPLATE)
            .context("register prioritization template")?;
        env.add_template("execution", EXECUTION_TEMPLATE)
            .context("register execution template")?;
        env.add_template("evaluation", EVALUATION_TEMPLATE)
            .context("register evaluation template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Render `template` with `ctx` and fit the result into the budget.
    pub fn render<S: Serialize>(&self, template: PromptTemplate, ctx: S) -> Result<String> {
        let rendered = self
            .env
            .get_template(template.name())?
            .render(ctx)
            .with_context(|| format!("render {} prompt", template.name()))?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize {
        let separators = secs.len().saturating_sub(1) * SECTION_SEPARATOR.len();
        secs.iter().map(|s| s.content.len()).sum::<usize>() + separators
    };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum::<usize>()
        + sections.len().saturating_sub(1) * SECTION_SEPARATOR.len();
    let allowed = budget.saturating_sub(other_len);
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    if allowed > TRUNCATION_NOTICE.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATION_NOTICE.len());
        last.content.push_str(TRUNCATION_NOTICE);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated prompt section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

fn truncate_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn preview(text: &str, max_bytes: usize) -> String {
    let mut owned = text.to_string();
    if owned.len() > max_bytes {
        truncate_at_char_boundary(&mut owned, max_bytes);
        owned.push('…');
    }
    owned
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    fn summary(name: &str, output: &str) -> EntrySummary {
        EntrySummary {
            name: name.to_string(),
            status: "success",
            output: output.to_string(),
        }
    }

    fn execution_ctx(similar: Vec<EntrySummary>, history: Vec<EntrySummary>) -> minijinja::Value {
        context! {
            objective => "build a login page",
            task => context! {
                name => "design schema",
                description => "users table",
                dependencies => Vec::<String>::new(),
            },
            similar => similar,
            history => history,
        }
    }

    #[test]
    fn sections_render_in_template_order() {
        let engine = PromptEngine::new(100_000).expect("engine");
        let prompt = engine
            .render(
                PromptTemplate::Execution,
                execution_ctx(vec![summary("a", "x")], vec![summary("b", "y")]),
            )
            .expect("render");
        let contract = prompt.find("### Execution Contract").expect("contract");
        let objective = prompt.find("### Objective").expect("objective");
        let task = prompt.find("### Task").expect("task");
        let similar = prompt.find("### Related Past Work").expect("similar");
        let history = prompt.find("### Recent History").expect("history");
        assert!(contract < objective && objective < task && task < similar && similar < history);
        assert!(!prompt.contains("<!--"));
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let engine = PromptEngine::new(100_000).expect("engine");
        let prompt = engine
            .render(PromptTemplate::Execution, execution_ctx(Vec::new(), Vec::new()))
            .expect("render");
        assert!(!prompt.contains("### Related Past Work"));
        assert!(!prompt.contains("### Recent History"));
    }

    #[test]
    fn budget_drops_similar_before_history() {
        let engine = PromptEngine::new(800).expect("engine");
        let prompt = engine
            .render(
                PromptTemplate::Execution,
                execution_ctx(
                    vec![summary("related", &"x".repeat(600))],
                    vec![summary("recent", "done")],
                ),
            )
            .expect("render");
        assert!(!prompt.contains("### Related Past Work"));
        assert!(prompt.contains("### Recent History"));
        assert!(prompt.contains("### Task"));
    }

    #[test]
    fn required_sections_are_truncated_last() {
        let mut sections = vec![
            ParsedSection {
                key: "contract".into(),
                required: true,
                content: "c".repeat(10),
            },
            ParsedSection {
                key: "task".into(),
                required: true,
                content: "t".repeat(100),
            },
        ];
        apply_budget_to_sections(&mut sections, 50);
        assert_eq!(sections.len(), 2);
        assert!(sections[1].content.ends_with("[truncated]"));
        assert!(render_sections(&sections).len() <= 50);
    }

    #[test]
    fn separators_count_against_the_budget() {
        let section = |key: &str, required: bool, len: usize| ParsedSection {
            key: key.into(),
            required,
            content: "x".repeat(len),
        };
        // Content alone fits in 60 bytes; the two separators push it to 64.
        let mut sections = vec![
            section("contract", true, 20),
            section("task", true, 20),
            section("history", false, 20),
        ];
        apply_budget_to_sections(&mut sections, 60);
        assert_eq!(sections.len(), 2);
        assert!(render_sections(&sections).len() <= 60);

        let mut sections = vec![section("contract", true, 30), section("task", true, 30)];
        apply_budget_to_sections(&mut sections, 60);
        assert!(sections[1].content.ends_with("[truncated]"));
        assert_eq!(render_sections(&sections).len(), 60);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let mut text = "héllo".to_string();
        truncate_at_char_boundary(&mut text, 2);
        assert_eq!(text, "h");
    }
}
