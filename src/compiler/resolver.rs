//! Entity Resolver: find vocabulary and grammar mentions in generated text
//! and resolve them against the knowledge graph.
//!
//! Extraction is model-first. When the model yields too few resolvable
//! entities a deterministic extractor runs over the same text and its
//! results are merged in, so a minimum entity set never depends on model
//! output quality alone.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::generator::{GenerationRequest, Schema, TextGenerator, decode};
use super::graph::KnowledgeGraph;
use super::models::{Entity, EntityKind};

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w〜~ー]+").expect("token regex is valid"));

/// Longest character run tried as a candidate inside unsegmented (CJK) text.
const MAX_CJK_SPAN: usize = 6;
/// Longest word n-gram tried in space-delimited text.
const MAX_WORD_NGRAM: usize = 3;
const MAX_CANDIDATES: usize = 4000;

const EXTRACTION_INSTRUCTIONS: &str = "You identify vocabulary items and grammar patterns used in a language-learning text. \
List each word in dictionary form and each grammar pattern exactly as a learner would look it up.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub min_words: usize,
    pub min_grammar: usize,
    pub min_text_chars: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_words: 8,
            min_grammar: 4,
            min_text_chars: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedEntities {
    pub words: Vec<Entity>,
    pub grammar: Vec<Entity>,
    /// Whether the deterministic extractor contributed.
    pub used_fallback: bool,
}

impl ResolvedEntities {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.grammar.is_empty()
    }

    fn contains(&self, id: &str) -> bool {
        self.words.iter().chain(&self.grammar).any(|e| e.id == id)
    }

    fn push(&mut self, entity: Entity) {
        if self.contains(&entity.id) {
            return;
        }
        match entity.kind {
            EntityKind::Word => self.words.push(entity),
            EntityKind::Grammar => self.grammar.push(entity),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    words: Vec<String>,
    #[serde(default)]
    grammar: Vec<String>,
}

pub struct EntityResolver {
    generator: Arc<dyn TextGenerator>,
    graph: Arc<dyn KnowledgeGraph>,
    config: ResolverConfig,
}

impl EntityResolver {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        graph: Arc<dyn KnowledgeGraph>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            generator,
            graph,
            config,
        }
    }

    /// Resolve the words and grammar used in `text`.
    ///
    /// Text shorter than `min_text_chars` skips extraction and returns empty
    /// sets; callers fall back to plan-based generation. Only graph store
    /// failures are returned as errors.
    pub async fn resolve(&self, text: &str, model: &str) -> Result<ResolvedEntities> {
        if text.trim().chars().count() < self.config.min_text_chars {
            return Ok(ResolvedEntities::default());
        }

        let mut resolved = ResolvedEntities::default();
        for candidate in self.extract_with_model(text, model).await {
            if let Some(entity) = self.graph.lookup_entity(&candidate).await? {
                resolved.push(entity);
            }
        }

        if resolved.words.len() < self.config.min_words
            || resolved.grammar.len() < self.config.min_grammar
        {
            tracing::debug!(
                words = resolved.words.len(),
                grammar = resolved.grammar.len(),
                "entity extraction insufficient, running deterministic extractor"
            );
            resolved.used_fallback = true;
            for candidate in extract_candidates(text) {
                if let Some(entity) = self.graph.lookup_entity(&candidate).await? {
                    resolved.push(entity);
                }
            }
        }

        Ok(resolved)
    }

    async fn extract_with_model(&self, text: &str, model: &str) -> Vec<String> {
        let request = GenerationRequest::new(
            Schema::EntityExtraction,
            model,
            EXTRACTION_INSTRUCTIONS,
            format!("## Text\n{}", text),
        );
        let parsed = match self.generator.generate(&request).await {
            Ok(value) => decode::<ExtractionResponse>(value),
            Err(e) => Err(e),
        };
        match parsed {
            Ok(response) => response
                .words
                .into_iter()
                .chain(response.grammar)
                .filter(|c| !c.trim().is_empty())
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "model entity extraction failed");
                Vec::new()
            }
        }
    }
}

fn is_unsegmented(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // hiragana, katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{AC00}'..='\u{D7AF}' // hangul
        | '\u{3005}' | '〜')
}

/// Deterministic candidate surface forms for `text`.
///
/// Space-delimited tokens yield themselves plus word n-grams; runs of
/// unsegmented script yield every substring up to [`MAX_CJK_SPAN`] chars.
/// Output order is stable and free of duplicates.
pub fn extract_candidates(text: &str) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: String, out: &mut Vec<String>| {
        if out.len() < MAX_CANDIDATES && seen.insert(candidate.clone()) {
            out.push(candidate);
        }
    };

    let tokens: Vec<&str> = TOKEN_RE.find_iter(text).map(|m| m.as_str()).collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.chars().any(is_unsegmented) {
            let chars: Vec<char> = token.chars().collect();
            for start in 0..chars.len() {
                for len in 1..=MAX_CJK_SPAN.min(chars.len() - start) {
                    push(chars[start..start + len].iter().collect(), &mut out);
                }
            }
        } else {
            push(token.to_string(), &mut out);
            for n in 2..=MAX_WORD_NGRAM {
                if i + n <= tokens.len()
                    && tokens[i..i + n]
                        .iter()
                        .all(|t| !t.chars().any(is_unsegmented))
                {
                    push(tokens[i..i + n].join(" "), &mut out);
                }
            }
        }
    }
    out
}
