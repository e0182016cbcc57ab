//! Prompt rendering for the diagnosis and fix capabilities.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed first and the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

const DIAGNOSE_TEMPLATE: &str = include_str!("prompts/diagnose.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

/// Default prompt budget in bytes.
pub const DEFAULT_PROMPT_BUDGET: usize = 32_000;

/// Inputs for a diagnosis request.
#[derive(Debug, Clone)]
pub struct DiagnoseInputs<'a> {
    pub target_file: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub failure: &'a str,
    pub previous: Option<&'a str>,
}

/// Inputs for a fix request.
#[derive(Debug, Clone)]
pub struct FixInputs<'a> {
    pub target_file: &'a str,
    pub summary: &'a str,
    pub suggestion: Option<&'a str>,
    pub failure: &'a str,
}

pub fn render_diagnose(input: &DiagnoseInputs<'_>, budget: usize) -> Result<String> {
    let env = environment()?;
    let rendered = env
        .get_template("diagnose")?
        .render(context! {
            target_file => input.target_file,
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            failure => input.failure.trim(),
            previous => input.previous.map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render diagnose prompt")?;
    Ok(fit_to_budget(&rendered, budget))
}

pub fn render_fix(input: &FixInputs<'_>, budget: usize) -> Result<String> {
    let env = environment()?;
    let rendered = env
        .get_template("fix")?
        .render(context! {
            target_file => input.target_file,
            summary => input.summary.trim(),
            suggestion => input.suggestion.map(str::trim).filter(|s| !s.is_empty()),
            failure => input.failure.trim(),
        })
        .context("render fix prompt")?;
    Ok(fit_to_budget(&rendered, budget))
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("diagnose", DIAGNOSE_TEMPLATE)
        .context("load diagnose template")?;
    env.add_template("fix", FIX_TEMPLATE)
        .context("load fix template")?;
    Ok(env)
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern should be valid")
});

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
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
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn fit_to_budget(rendered: &str, budget: usize) -> String {
    let mut sections = parse_sections(rendered);
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["history", "failure"] {
        if total(&sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, bytes_dropped = sections[idx].content.len(), "dropped prompt section");
            sections.remove(idx);
        }
    }

    if total(&sections) > budget
        && let Some((last, rest)) = sections.split_last_mut()
    {
        let allowed = budget.saturating_sub(rest.iter().map(|s| s.content.len()).sum());
        truncate_on_boundary(&mut last.content, allowed);
    }

    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_on_boundary(content: &mut String, allowed: usize) {
    const MARKER: &str = "\n[truncated]";
    if content.len() <= allowed {
        return;
    }
    let mut cut = allowed.saturating_sub(MARKER.len());
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content.truncate(cut);
    if allowed > MARKER.len() {
        content.push_str(MARKER);
    }
}
