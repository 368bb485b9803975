//! Card Generators and lesson-plan generation.
//!
//! Every card is produced from the same inputs: the objective, the shared
//! lesson plan, an optional kit context and whatever cards already exist.
//! Generators never touch sessions or storage; the orchestrator owns both.

use std::sync::Arc;

use super::generator::{GenerationRequest, Schema, TextGenerator, decode};
use super::kit::KitContext;
use super::models::{
    Card, CardKind, CultureCard, DialogueCard, DrillsCard, ExercisesCard, GrammarCard,
    GuidedDialogueCard, LessonDocument, LessonPlan, Objective, ObjectiveCard, PreLessonKit,
    ReadingCard, VocabularyCard,
};
use super::resolver::ResolvedEntities;
use crate::errors::GenerationError;

const PLAN_INSTRUCTIONS: &str = "You are a language-lesson designer. Given a learning objective, \
produce a compact lesson plan: a topic, a concrete scenario, the target words and grammar \
patterns the lesson will teach, and one cultural focus.";

fn instructions(kind: CardKind) -> &'static str {
    match kind {
        CardKind::Objective => {
            "Write the objective card: a short title, a one-paragraph summary of what the learner will be able to do, and observable success criteria."
        }
        CardKind::Vocabulary => {
            "Write the vocabulary card. Use exactly the listed target words, in dictionary form, each with its reading when the script needs one and a meaning in the metalanguage."
        }
        CardKind::Grammar => {
            "Write the grammar card. Explain each listed pattern in the metalanguage and give two short example sentences."
        }
        CardKind::Dialogue => {
            "Write a natural dialogue for the lesson scenario that uses the lesson vocabulary and grammar. Give each line a translation in the metalanguage."
        }
        CardKind::Reading => {
            "Write a short reading passage that retells or extends the dialogue below, followed by comprehension questions with answers."
        }
        CardKind::Culture => {
            "Write a culture note for the lesson's cultural focus, tied to the dialogue situation, with key phrases a learner would hear."
        }
        CardKind::GuidedDialogue => {
            "Write a guided dialogue where the learner plays one side: each turn has a prompt, an optional hint and a model answer using the lesson material."
        }
        CardKind::Drills => {
            "Write substitution drills for the lesson grammar: for each drill give the pattern, a cue and the expected response."
        }
        CardKind::Exercises => {
            "Write practice exercises covering the lesson vocabulary, grammar and dialogue. Multiple-choice items list their choices."
        }
    }
}

/// Earlier cards a generator reads as shared context.
fn dependencies(kind: CardKind) -> &'static [CardKind] {
    match kind {
        CardKind::Objective | CardKind::Vocabulary | CardKind::Grammar => &[],
        CardKind::Dialogue => &[CardKind::Vocabulary, CardKind::Grammar],
        CardKind::Reading | CardKind::Culture => &[CardKind::Dialogue],
        CardKind::GuidedDialogue => &[CardKind::Dialogue, CardKind::Vocabulary],
        CardKind::Drills => &[CardKind::Grammar],
        CardKind::Exercises => &[CardKind::Vocabulary, CardKind::Grammar, CardKind::Dialogue],
    }
}

/// Inputs shared by every generator in a run.
pub struct CardContext<'a> {
    pub objective: &'a Objective,
    pub plan: &'a LessonPlan,
    pub metalanguage: &'a str,
    pub model: &'a str,
    pub kit: Option<&'a KitContext>,
    /// Entities resolved for the vocabulary and grammar cards. Empty sets
    /// mean those cards are built from the plan's targets instead.
    pub entities: &'a ResolvedEntities,
    /// Cards from earlier stages (or the base version on retry).
    pub document: &'a LessonDocument,
}

impl CardContext<'_> {
    /// Most recent card of `kind`: this stage's output first, then the document.
    fn prior<'b>(&'b self, kind: CardKind, stage_cards: &'b [Card]) -> Option<&'b Card> {
        stage_cards
            .iter()
            .find(|c| c.kind() == kind)
            .or_else(|| self.document.card(kind))
    }
}

/// Plan used when the planning call fails: built from objective metadata
/// and, when present, the kit's own targets.
pub fn fallback_plan(objective: &Objective, kit: Option<&PreLessonKit>) -> LessonPlan {
    let topic = if objective.topic.trim().is_empty() {
        objective.description.clone()
    } else {
        objective.topic.clone()
    };
    let scenario = match kit {
        Some(k) if !k.context.trim().is_empty() => k.context.clone(),
        _ => objective.description.clone(),
    };
    LessonPlan {
        culture_focus: topic.clone(),
        topic,
        scenario,
        target_words: kit
            .map(|k| k.words.iter().map(|w| w.surface.clone()).collect())
            .unwrap_or_default(),
        target_grammar: kit
            .map(|k| k.grammar.iter().map(|g| g.pattern.clone()).collect())
            .unwrap_or_default(),
    }
}

fn objective_section(objective: &Objective) -> String {
    let mut out = format!(
        "## Objective\n{}: {}\n",
        objective.id, objective.description
    );
    if !objective.topic.is_empty() {
        out.push_str(&format!("Topic: {}\n", objective.topic));
    }
    if let Some(level) = &objective.level {
        out.push_str(&format!("Level: {}\n", level));
    }
    if let Some(skill) = &objective.skill {
        out.push_str(&format!("Skill: {}\n", skill));
    }
    out
}

fn plan_section(plan: &LessonPlan) -> String {
    format!(
        "## Lesson plan\nTopic: {}\nScenario: {}\nTarget words: {}\nTarget grammar: {}\nCultural focus: {}\n",
        plan.topic,
        plan.scenario,
        plan.target_words.join(", "),
        plan.target_grammar.join(", "),
        plan.culture_focus
    )
}

pub struct CardGenerators {
    generator: Arc<dyn TextGenerator>,
}

impl CardGenerators {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Generate the shared lesson plan. Never fails: any generation error
    /// yields [`fallback_plan`].
    pub async fn plan(
        &self,
        objective: &Objective,
        metalanguage: &str,
        model: &str,
        kit: Option<&PreLessonKit>,
    ) -> LessonPlan {
        let mut prompt = objective_section(objective);
        prompt.push_str(&format!("\n## Metalanguage\n{}\n", metalanguage));
        if let Some(kit) = kit.filter(|k| !k.is_empty()) {
            prompt.push('\n');
            prompt.push_str(&super::kit::build_context(kit).prompt_block());
        }
        let request = GenerationRequest::new(Schema::LessonPlan, model, PLAN_INSTRUCTIONS, prompt);

        let result = match self.generator.generate(&request).await {
            Ok(value) => decode::<LessonPlan>(value),
            Err(e) => Err(e),
        };
        match result {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(objective_id = %objective.id, error = %e, "plan generation failed, using fallback plan");
                fallback_plan(objective, kit)
            }
        }
    }

    fn build_prompt(&self, kind: CardKind, ctx: &CardContext<'_>, stage_cards: &[Card]) -> String {
        let mut prompt = objective_section(ctx.objective);
        prompt.push('\n');
        prompt.push_str(&plan_section(ctx.plan));
        prompt.push_str(&format!(
            "\n## Metalanguage\nWrite explanations and translations in {}.\n",
            ctx.metalanguage
        ));

        match kind {
            CardKind::Vocabulary => {
                let words: Vec<String> = if ctx.entities.words.is_empty() {
                    ctx.plan.target_words.clone()
                } else {
                    ctx.entities.words.iter().map(|e| e.surface.clone()).collect()
                };
                prompt.push_str(&format!("\n## Target words\n{}\n", words.join("\n")));
            }
            CardKind::Grammar => {
                let patterns: Vec<String> = if ctx.entities.grammar.is_empty() {
                    ctx.plan.target_grammar.clone()
                } else {
                    ctx.entities.grammar.iter().map(|e| e.surface.clone()).collect()
                };
                prompt.push_str(&format!("\n## Target grammar\n{}\n", patterns.join("\n")));
            }
            _ => {}
        }

        for dep in dependencies(kind) {
            if let Some(card) = ctx.prior(*dep, stage_cards) {
                prompt.push_str(&format!("\n## {} card\n{}\n", dep, card.text()));
            }
        }

        if let Some(kit) = ctx.kit.filter(|k| !k.is_empty()) {
            prompt.push('\n');
            prompt.push_str(&kit.prompt_block());
        }
        prompt
    }

    /// Generate one card. `stage_cards` holds cards already produced by the
    /// current stage, in sub-order.
    pub async fn generate(
        &self,
        kind: CardKind,
        ctx: &CardContext<'_>,
        stage_cards: &[Card],
    ) -> Result<Card, GenerationError> {
        let prompt = self.build_prompt(kind, ctx, stage_cards);
        let request =
            GenerationRequest::new(Schema::Card(kind), ctx.model, instructions(kind), prompt);
        let value = self.generator.generate(&request).await?;

        let card = match kind {
            CardKind::Objective => Card::Objective(decode::<ObjectiveCard>(value)?),
            CardKind::Dialogue => Card::Dialogue(decode::<DialogueCard>(value)?),
            CardKind::Reading => Card::Reading(decode::<ReadingCard>(value)?),
            CardKind::Vocabulary => {
                let mut card = decode::<VocabularyCard>(value)?;
                for entry in &mut card.entries {
                    if entry.entity_id.is_none() {
                        entry.entity_id = ctx
                            .entities
                            .words
                            .iter()
                            .find(|e| e.surface == entry.surface)
                            .map(|e| e.id.clone());
                    }
                }
                Card::Vocabulary(card)
            }
            CardKind::Grammar => {
                let mut card = decode::<GrammarCard>(value)?;
                for point in &mut card.points {
                    if point.entity_id.is_none() {
                        point.entity_id = ctx
                            .entities
                            .grammar
                            .iter()
                            .find(|e| e.surface == point.pattern)
                            .map(|e| e.id.clone());
                    }
                }
                Card::Grammar(card)
            }
            CardKind::GuidedDialogue => Card::GuidedDialogue(decode::<GuidedDialogueCard>(value)?),
            CardKind::Exercises => Card::Exercises(decode::<ExercisesCard>(value)?),
            CardKind::Culture => Card::Culture(decode::<CultureCard>(value)?),
            CardKind::Drills => Card::Drills(decode::<DrillsCard>(value)?),
        };

        card.validate().map_err(GenerationError::MalformedOutput)?;
        Ok(card)
    }
}
