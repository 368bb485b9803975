use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Stages ────────────────────────────────────────────────────────────

/// The four externally visible compilation stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Content,
    Comprehension,
    Production,
    Interaction,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Content,
        Stage::Comprehension,
        Stage::Production,
        Stage::Interaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Comprehension => "comprehension",
            Self::Production => "production",
            Self::Interaction => "interaction",
        }
    }

    /// Cards owned by this stage, in generation sub-order. Later cards may
    /// read earlier ones (the reading card is written around the dialogue).
    pub fn cards(&self) -> &'static [CardKind] {
        match self {
            Self::Content => &[CardKind::Objective, CardKind::Vocabulary, CardKind::Grammar],
            Self::Comprehension => &[CardKind::Dialogue, CardKind::Reading, CardKind::Culture],
            Self::Production => &[CardKind::GuidedDialogue, CardKind::Drills],
            Self::Interaction => &[CardKind::Exercises],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "comprehension" => Ok(Self::Comprehension),
            "production" => Ok(Self::Production),
            "interaction" => Ok(Self::Interaction),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Per-stage status. `Complete` is terminal-success; `Failed` is retryable.
///
/// Serialized as a plain string: `pending`, `generating`, `complete`, or
/// `failed: <reason>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StageStatus {
    Pending,
    Generating,
    Complete,
    Failed { reason: String },
}

impl StageStatus {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Only settled stages may be regenerated on request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Generating => f.write_str("generating"),
            Self::Complete => f.write_str("complete"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

impl From<StageStatus> for String {
    fn from(status: StageStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for StageStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "generating" => Ok(Self::Generating),
            "complete" => Ok(Self::Complete),
            other => match other.strip_prefix("failed") {
                Some(rest) => Ok(Self::failed(rest.trim_start_matches(':').trim())),
                None => Err(format!("Invalid stage status: {}", s)),
            },
        }
    }
}

/// Status of all four stages; iteration follows stage order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatusMap(BTreeMap<Stage, StageStatus>);

impl StageStatusMap {
    pub fn all_pending() -> Self {
        Self(
            Stage::ALL
                .iter()
                .map(|stage| (*stage, StageStatus::Pending))
                .collect(),
        )
    }

    pub fn get(&self, stage: Stage) -> &StageStatus {
        self.0.get(&stage).unwrap_or(&StageStatus::Pending)
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        self.0.insert(stage, status);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageStatus)> {
        Stage::ALL.into_iter().map(move |stage| (stage, self.get(stage)))
    }

    pub fn all_complete(&self) -> bool {
        self.iter().all(|(_, status)| status.is_complete())
    }
}

impl Default for StageStatusMap {
    fn default() -> Self {
        Self::all_pending()
    }
}

// ── Cards ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Objective,
    Dialogue,
    Reading,
    Vocabulary,
    Grammar,
    GuidedDialogue,
    Exercises,
    Culture,
    Drills,
}

impl CardKind {
    pub const ALL: [CardKind; 9] = [
        CardKind::Objective,
        CardKind::Dialogue,
        CardKind::Reading,
        CardKind::Vocabulary,
        CardKind::Grammar,
        CardKind::GuidedDialogue,
        CardKind::Exercises,
        CardKind::Culture,
        CardKind::Drills,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Objective => "objective",
            Self::Dialogue => "dialogue",
            Self::Reading => "reading",
            Self::Vocabulary => "vocabulary",
            Self::Grammar => "grammar",
            Self::GuidedDialogue => "guided_dialogue",
            Self::Exercises => "exercises",
            Self::Culture => "culture",
            Self::Drills => "drills",
        }
    }

    /// The stage that owns this card.
    pub fn stage(&self) -> Stage {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.cards().contains(self))
            .unwrap_or(Stage::Content)
    }
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveCard {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueCard {
    pub setting: String,
    pub lines: Vec<DialogueLine>,
    /// Graph entity ids found in the dialogue text.
    #[serde(default)]
    pub linked_entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensionQuestion {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingCard {
    pub title: String,
    pub passage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default)]
    pub questions: Vec<ComprehensionQuestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub surface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading: Option<String>,
    pub meaning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyCard {
    pub entries: Vec<VocabularyEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrammarPoint {
    pub pattern: String,
    pub explanation: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrammarCard {
    pub points: Vec<GrammarPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidedTurn {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub model_answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidedDialogueCard {
    pub scenario: String,
    pub turns: Vec<GuidedTurn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub instruction: String,
    pub prompt: String,
    pub answer: String,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExercisesCard {
    pub items: Vec<Exercise>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureCard {
    pub title: String,
    pub note: String,
    #[serde(default)]
    pub key_phrases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drill {
    pub pattern: String,
    pub cue: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillsCard {
    pub drills: Vec<Drill>,
}

/// One named section of the compiled document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Card {
    Objective(ObjectiveCard),
    Dialogue(DialogueCard),
    Reading(ReadingCard),
    Vocabulary(VocabularyCard),
    Grammar(GrammarCard),
    GuidedDialogue(GuidedDialogueCard),
    Exercises(ExercisesCard),
    Culture(CultureCard),
    Drills(DrillsCard),
}

impl Card {
    pub fn kind(&self) -> CardKind {
        match self {
            Self::Objective(_) => CardKind::Objective,
            Self::Dialogue(_) => CardKind::Dialogue,
            Self::Reading(_) => CardKind::Reading,
            Self::Vocabulary(_) => CardKind::Vocabulary,
            Self::Grammar(_) => CardKind::Grammar,
            Self::GuidedDialogue(_) => CardKind::GuidedDialogue,
            Self::Exercises(_) => CardKind::Exercises,
            Self::Culture(_) => CardKind::Culture,
            Self::Drills(_) => CardKind::Drills,
        }
    }

    /// Reject structurally valid but empty cards.
    pub fn validate(&self) -> Result<(), String> {
        let empty = match self {
            Self::Objective(c) => c.title.trim().is_empty(),
            Self::Dialogue(c) => c.lines.is_empty(),
            Self::Reading(c) => c.passage.trim().is_empty(),
            Self::Vocabulary(c) => c.entries.is_empty(),
            Self::Grammar(c) => c.points.is_empty(),
            Self::GuidedDialogue(c) => c.turns.is_empty(),
            Self::Exercises(c) => c.items.is_empty(),
            Self::Culture(c) => c.note.trim().is_empty(),
            Self::Drills(c) => c.drills.is_empty(),
        };
        if empty {
            Err(format!("{} card has no content", self.kind()))
        } else {
            Ok(())
        }
    }

    /// Learner-facing text of the card, one fragment per line.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        match self {
            Self::Objective(c) => {
                parts.push(&c.title);
                parts.push(&c.summary);
                parts.extend(c.success_criteria.iter().map(String::as_str));
            }
            Self::Dialogue(c) => {
                parts.push(&c.setting);
                for line in &c.lines {
                    parts.push(&line.text);
                    parts.extend(line.translation.as_deref());
                }
            }
            Self::Reading(c) => {
                parts.push(&c.title);
                parts.push(&c.passage);
                parts.extend(c.translation.as_deref());
                for q in &c.questions {
                    parts.push(&q.question);
                    parts.push(&q.answer);
                }
            }
            Self::Vocabulary(c) => {
                for entry in &c.entries {
                    parts.push(&entry.surface);
                    parts.extend(entry.reading.as_deref());
                    parts.push(&entry.meaning);
                }
            }
            Self::Grammar(c) => {
                for point in &c.points {
                    parts.push(&point.pattern);
                    parts.push(&point.explanation);
                    parts.extend(point.examples.iter().map(String::as_str));
                }
            }
            Self::GuidedDialogue(c) => {
                parts.push(&c.scenario);
                for turn in &c.turns {
                    parts.push(&turn.prompt);
                    parts.extend(turn.hint.as_deref());
                    parts.push(&turn.model_answer);
                }
            }
            Self::Exercises(c) => {
                for item in &c.items {
                    parts.push(&item.instruction);
                    parts.push(&item.prompt);
                    parts.push(&item.answer);
                    parts.extend(item.choices.iter().map(String::as_str));
                }
            }
            Self::Culture(c) => {
                parts.push(&c.title);
                parts.push(&c.note);
                parts.extend(c.key_phrases.iter().map(String::as_str));
            }
            Self::Drills(c) => {
                for drill in &c.drills {
                    parts.push(&drill.pattern);
                    parts.push(&drill.cue);
                    parts.push(&drill.response);
                }
            }
        }
        parts.join("\n")
    }
}

// ── Kit ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitWord {
    pub surface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meaning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitGrammar {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitPhrase {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
}

/// Pre-computed reinforcement material tied to an objective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreLessonKit {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub words: Vec<KitWord>,
    #[serde(default)]
    pub grammar: Vec<KitGrammar>,
    #[serde(default)]
    pub phrases: Vec<KitPhrase>,
}

impl PreLessonKit {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.grammar.is_empty() && self.phrases.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub used: Vec<String>,
    pub count: usize,
    pub total: usize,
    pub required: usize,
    pub meets_requirement: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitUsageReport {
    pub words: CategoryUsage,
    pub grammar: CategoryUsage,
    pub phrases: CategoryUsage,
    pub all_requirements_met: bool,
    pub usage_percentage: f64,
}

// ── Document ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub objective_id: String,
    pub metalanguage: String,
    pub model: String,
    pub generation_status: StageStatusMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit_available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit_usage: Option<KitUsageReport>,
}

/// The assembled lesson. Cards are keyed by kind, so each kind appears at
/// most once and iteration follows the canonical card order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonDocument {
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub cards: BTreeMap<CardKind, Card>,
}

impl LessonDocument {
    pub fn new(objective_id: &str, metalanguage: &str, model: &str) -> Self {
        Self {
            metadata: DocumentMetadata {
                objective_id: objective_id.to_string(),
                metalanguage: metalanguage.to_string(),
                model: model.to_string(),
                generation_status: StageStatusMap::all_pending(),
                kit_available: None,
                kit_usage: None,
            },
            cards: BTreeMap::new(),
        }
    }

    pub fn card(&self, kind: CardKind) -> Option<&Card> {
        self.cards.get(&kind)
    }

    /// Swap in the cards a stage produced. Cards owned by other stages are
    /// never touched, and a kind missing from `cards` keeps its old value.
    pub fn replace_stage_cards(&mut self, stage: Stage, cards: Vec<Card>) {
        for card in cards {
            if card.kind().stage() == stage {
                self.cards.insert(card.kind(), card);
            }
        }
    }

    /// All learner-facing card text, used for kit auditing.
    pub fn text(&self) -> String {
        self.cards
            .values()
            .map(Card::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Knowledge graph ───────────────────────────────────────────────────

/// Objective metadata as stored in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Word,
    Grammar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub surface: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meaning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// Relationship written from an objective to an entity it uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    UsesWord,
    UsesGrammar,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsesWord => "USES_WORD",
            Self::UsesGrammar => "USES_GRAMMAR",
        }
    }

    pub fn for_entity(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Word => Self::UsesWord,
            EntityKind::Grammar => Self::UsesGrammar,
        }
    }
}

// ── Planning artifact ─────────────────────────────────────────────────

/// The "master" plan shared by every card generator in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlan {
    pub topic: String,
    pub scenario: String,
    #[serde(default)]
    pub target_words: Vec<String>,
    #[serde(default)]
    pub target_grammar: Vec<String>,
    #[serde(default)]
    pub culture_focus: String,
}

// ── Persistence ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonRecord {
    pub id: i64,
    pub objective_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonVersion {
    pub lesson_id: i64,
    pub version: i64,
    pub document: LessonDocument,
    pub created_at: String,
}

/// Version listing entry (document omitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: i64,
    pub generation_status: StageStatusMap,
    pub created_at: String,
}
