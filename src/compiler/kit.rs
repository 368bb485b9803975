//! Kit Context Builder and Kit Usage Auditor.
//!
//! A pre-lesson kit lists words, grammar patterns and fixed phrases the
//! lesson should reinforce. The builder turns it into prompt context plus
//! minimum-usage requirements; the auditor checks the finished document
//! against those requirements. Matching is literal, case-sensitive substring
//! search over card text: inflected or otherwise altered forms are not
//! counted as used.

use serde::{Deserialize, Serialize};

use super::models::{CategoryUsage, KitUsageReport, LessonDocument, PreLessonKit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitCategory {
    Words,
    Grammar,
    Phrases,
}

impl KitCategory {
    /// `(floor_min, percent)` of the requirement formula.
    fn rule(&self) -> (usize, usize) {
        match self {
            Self::Words => (6, 30),
            Self::Grammar => (2, 20),
            Self::Phrases => (2, 20),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Words => "kit words",
            Self::Grammar => "kit grammar patterns",
            Self::Phrases => "kit phrases",
        }
    }
}

/// `max(floor_min, ceil(n * fraction))`, or 0 when the category is empty.
pub fn required_count(category: KitCategory, total: usize) -> usize {
    if total == 0 {
        return 0;
    }
    let (floor_min, percent) = category.rule();
    floor_min.max((total * percent).div_ceil(100))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitRequirement {
    pub category: KitCategory,
    pub total: usize,
    pub required: usize,
}

/// Prompt-injectable kit context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitContext {
    pub context_lines: Vec<String>,
    pub requirement_lines: Vec<String>,
    pub requirements: Vec<KitRequirement>,
}

impl KitContext {
    pub fn is_empty(&self) -> bool {
        self.context_lines.is_empty() && self.requirement_lines.is_empty()
    }

    /// Markdown block appended to card-generation prompts.
    pub fn prompt_block(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut block = String::from("## Reinforcement kit\n");
        for line in &self.context_lines {
            block.push_str("- ");
            block.push_str(line);
            block.push('\n');
        }
        if !self.requirement_lines.is_empty() {
            block.push_str("\n## Kit requirements\n");
            for line in &self.requirement_lines {
                block.push_str("- ");
                block.push_str(line);
                block.push('\n');
            }
        }
        block
    }
}

fn annotate(main: &str, notes: &[Option<&str>]) -> String {
    let notes: Vec<&str> = notes.iter().flatten().copied().collect();
    if notes.is_empty() {
        main.to_string()
    } else {
        format!("{} ({})", main, notes.join(", "))
    }
}

/// Derive context strings and usage requirements from a kit.
///
/// Empty lists contribute neither a context line nor a requirement.
pub fn build_context(kit: &PreLessonKit) -> KitContext {
    let mut ctx = KitContext::default();

    if !kit.context.trim().is_empty() {
        ctx.context_lines
            .push(format!("Situation: {}", kit.context.trim()));
    }

    let categories: [(KitCategory, Vec<String>); 3] = [
        (
            KitCategory::Words,
            kit.words
                .iter()
                .map(|w| annotate(&w.surface, &[w.reading.as_deref(), w.meaning.as_deref()]))
                .collect(),
        ),
        (
            KitCategory::Grammar,
            kit.grammar
                .iter()
                .map(|g| annotate(&g.pattern, &[g.explanation.as_deref()]))
                .collect(),
        ),
        (
            KitCategory::Phrases,
            kit.phrases
                .iter()
                .map(|p| annotate(&p.text, &[p.translation.as_deref()]))
                .collect(),
        ),
    ];

    for (category, items) in categories {
        if items.is_empty() {
            continue;
        }
        let required = required_count(category, items.len());
        ctx.context_lines
            .push(format!("Reuse {}: {}", category.label(), items.join("; ")));
        ctx.requirement_lines.push(format!(
            "Use at least {} of the {} {} verbatim.",
            required,
            items.len(),
            category.label()
        ));
        ctx.requirements.push(KitRequirement {
            category,
            total: items.len(),
            required,
        });
    }

    ctx
}

fn category_usage(category: KitCategory, items: &[&str], text: &str) -> CategoryUsage {
    let used: Vec<String> = items
        .iter()
        .filter(|item| !item.is_empty() && text.contains(**item))
        .map(|item| item.to_string())
        .collect();
    let required = required_count(category, items.len());
    CategoryUsage {
        count: used.len(),
        total: items.len(),
        required,
        meets_requirement: used.len() >= required,
        used,
    }
}

/// Report how much of the kit the document actually uses. Observational
/// only; never fails.
pub fn audit_usage(document: &LessonDocument, kit: &PreLessonKit) -> KitUsageReport {
    let text = document.text();
    let words: Vec<&str> = kit.words.iter().map(|w| w.surface.as_str()).collect();
    let grammar: Vec<&str> = kit.grammar.iter().map(|g| g.pattern.as_str()).collect();
    let phrases: Vec<&str> = kit.phrases.iter().map(|p| p.text.as_str()).collect();

    let words = category_usage(KitCategory::Words, &words, &text);
    let grammar = category_usage(KitCategory::Grammar, &grammar, &text);
    let phrases = category_usage(KitCategory::Phrases, &phrases, &text);

    let all_requirements_met = [&words, &grammar, &phrases]
        .iter()
        .filter(|c| c.total > 0)
        .all(|c| c.meets_requirement);

    let matched = words.count + grammar.count + phrases.count;
    let total = words.total + grammar.total + phrases.total;
    let usage_percentage = if total == 0 {
        0.0
    } else {
        100.0 * matched as f64 / total as f64
    };

    KitUsageReport {
        words,
        grammar,
        phrases,
        all_requirements_met,
        usage_percentage,
    }
}
