//! Context assembly: the prompt handed to the agent each iteration.
//!
//! The default [`PromptAssembler`] renders `prompts/story.md` with minijinja and
//! then enforces a byte budget. The template marks each section with
//! `<!-- section:KEY required|droppable -->`; droppable sections are removed in
//! a fixed order until the prompt fits. Guardrails are always kept whole.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::backlog::{Backlog, Story, StoryStatus};
use crate::core::guardrail::GuardrailEntry;
use crate::io::config::GateSpec;

const STORY_TEMPLATE: &str = include_str!("../prompts/story.md");

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 2] = ["backlog", "progress"];

/// Everything the assembler may draw from.
#[derive(Debug, Clone, Copy)]
pub struct ContextInput<'a> {
    pub iteration: u32,
    pub backlog: &'a Backlog,
    pub story: &'a Story,
    /// Recent progress entries, oldest first.
    pub recent_progress: &'a [String],
    /// The full guardrail ledger.
    pub guardrails: &'a [GuardrailEntry],
    pub gates: &'a [GateSpec],
}

pub trait ContextAssembler {
    fn build(&self, input: &ContextInput<'_>) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
struct StoryView<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    acceptance_criteria: &'a [String],
    phase: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct DoneView<'a> {
    id: &'a str,
    title: &'a str,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Template-rendered markdown prompt with a byte budget.
pub struct PromptAssembler {
    env: Environment<'static>,
    section_re: Regex,
    budget_bytes: usize,
}

impl PromptAssembler {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("story", STORY_TEMPLATE)
            .context("parse story template")?;
        let section_re = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .context("compile section marker regex")?;
        Ok(Self {
            env,
            section_re,
            budget_bytes,
        })
    }

    fn render(&self, input: &ContextInput<'_>) -> Result<String> {
        let story = input.story;
        let completed: Vec<DoneView<'_>> = input
            .backlog
            .stories
            .iter()
            .filter(|s| s.status == StoryStatus::Complete)
            .map(|s| DoneView {
                id: &s.id,
                title: &s.title,
            })
            .collect();
        let phase_name = story
            .phase
            .and_then(|p| input.backlog.phases.get(&p))
            .map(|p| p.name.as_str())
            .filter(|name| !name.is_empty());

        let template = self.env.get_template("story")?;
        let rendered = template.render(context! {
            iteration => input.iteration,
            project => if input.backlog.project.is_empty() { "this project" } else { input.backlog.project.as_str() },
            story => StoryView {
                id: &story.id,
                title: &story.title,
                description: story.description.trim(),
                acceptance_criteria: &story.acceptance_criteria,
                phase: story.phase,
            },
            phase_name => phase_name,
            gates => input.gates,
            guardrails => input.guardrails,
            progress => input.recent_progress,
            completed => completed,
        })?;
        Ok(rendered)
    }

    /// Parse sections using HTML comment markers.
    fn parse_sections(&self, rendered: &str) -> Vec<ParsedSection> {
        let markers: Vec<_> = self.section_re.captures_iter(rendered).collect();
        let mut sections = Vec::new();
        for (i, caps) in markers.iter().enumerate() {
            let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(rendered.len(), |m| m.start());
            let content = rendered[whole.end()..end].trim().to_string();
            if content.is_empty() {
                continue;
            }
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required: kind.as_str() == "required",
                content,
            });
        }
        sections
    }

    fn apply_budget(&self, sections: &mut Vec<ParsedSection>) {
        let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

        for key in DROP_ORDER {
            if total(sections) <= self.budget_bytes {
                return;
            }
            if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
                debug!(
                    section = key,
                    bytes_dropped = sections[idx].content.len(),
                    "dropped section for budget"
                );
                sections.remove(idx);
            }
        }
        if total(sections) > self.budget_bytes {
            warn!(
                bytes = total(sections),
                budget = self.budget_bytes,
                "required context exceeds budget"
            );
        }
    }
}

impl ContextAssembler for PromptAssembler {
    fn build(&self, input: &ContextInput<'_>) -> Result<String> {
        let rendered = self.render(input).context("render story context")?;
        let mut sections = self.parse_sections(&rendered);
        self.apply_budget(&mut sections);
        let mut out = sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        out.push('\n');
        Ok(out)
    }
}
