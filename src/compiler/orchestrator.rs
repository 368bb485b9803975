//! Stage Orchestrator.
//!
//! Runs the four stages of a compilation strictly in order. Each stage runs
//! its card generators in sub-order; a generator failure fails that stage
//! only and the run moves on (a later stage is attempted even when an
//! earlier one failed). Every completed stage appends a new version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::cards::{CardContext, CardGenerators};
use super::db::DbHandle;
use super::events::{CompileEvent, CompileOutcome, ProgressEmitter};
use super::generator::TextGenerator;
use super::graph::KnowledgeGraph;
use super::kit::{KitContext, audit_usage, build_context};
use super::models::{
    Card, LessonDocument, LessonPlan, LessonRecord, LessonVersion, Objective, PreLessonKit,
    RelationKind, Stage, StageStatus, VersionSummary,
};
use super::resolver::{EntityResolver, ResolvedEntities, ResolverConfig};
use super::session::{LessonSession, SessionManager};
use crate::errors::{CompileError, GenerationError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    pub objective_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metalanguage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner_id: Option<String>,
    /// Overrides the automatic lookup by learner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit: Option<PreLessonKit>,
}

impl CompileRequest {
    pub fn new(objective_id: &str) -> Self {
        Self {
            objective_id: objective_id.to_string(),
            metalanguage: None,
            model: None,
            learner_id: None,
            kit: None,
        }
    }
}

/// Result of a stage retry. `version` is the new version on success, or
/// the current version when the stage failed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub lesson_id: i64,
    pub version: i64,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip)]
    pub document: Option<LessonDocument>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_model: String,
    pub default_metalanguage: String,
    pub max_conflict_retries: u32,
    pub resolver: ResolverConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet".to_string(),
            default_metalanguage: "en".to_string(),
            max_conflict_retries: 5,
            resolver: ResolverConfig::default(),
        }
    }
}

/// Everything a stage needs besides the document it builds on.
struct StageInputs<'a> {
    objective: &'a Objective,
    plan: &'a LessonPlan,
    metalanguage: &'a str,
    model: &'a str,
    kit: Option<&'a KitContext>,
}

pub struct Orchestrator {
    graph: Arc<dyn KnowledgeGraph>,
    db: DbHandle,
    sessions: Arc<SessionManager>,
    cards: CardGenerators,
    resolver: EntityResolver,
    config: OrchestratorConfig,
    /// Serializes runs and retries per objective. Idle entries are pruned
    /// whenever a lock is handed out.
    objective_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        graph: Arc<dyn KnowledgeGraph>,
        db: DbHandle,
        sessions: Arc<SessionManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cards: CardGenerators::new(generator.clone()),
            resolver: EntityResolver::new(generator, graph.clone(), config.resolver),
            graph,
            db,
            sessions,
            config,
            objective_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Open or reuse the live session for a known objective.
    pub async fn create_session(
        &self,
        objective_id: &str,
        learner_id: Option<&str>,
    ) -> Result<LessonSession, CompileError> {
        let objective = self.fetch_objective(objective_id).await?;
        Ok(self.sessions.create_or_get(&objective.id, learner_id))
    }

    pub async fn lesson_for_objective(
        &self,
        objective_id: &str,
    ) -> Result<Option<LessonRecord>, CompileError> {
        let objective_id = objective_id.to_string();
        self.db
            .call(move |db| db.find_lesson(&objective_id))
            .await
            .map_err(CompileError::Persistence)
    }

    /// Version history of a lesson, oldest first.
    pub async fn history(&self, lesson_id: i64) -> Result<Vec<VersionSummary>, CompileError> {
        self.db
            .call(move |db| {
                if db.get_lesson(lesson_id)?.is_none() {
                    return Ok(None);
                }
                db.list_versions(lesson_id).map(Some)
            })
            .await
            .map_err(CompileError::Persistence)?
            .ok_or(CompileError::LessonNotFound { lesson_id })
    }

    /// Highest-numbered version of a lesson.
    pub async fn current_version(&self, lesson_id: i64) -> Result<LessonVersion, CompileError> {
        self.db
            .call(move |db| db.current_version(lesson_id))
            .await
            .map_err(CompileError::Persistence)?
            .ok_or(CompileError::LessonNotFound { lesson_id })
    }

    pub async fn version(&self, lesson_id: i64, version: i64) -> Result<LessonVersion, CompileError> {
        let found = self
            .db
            .call(move |db| {
                if db.get_lesson(lesson_id)?.is_none() {
                    return Ok(None);
                }
                db.get_version(lesson_id, version).map(Some)
            })
            .await
            .map_err(CompileError::Persistence)?;
        match found {
            None => Err(CompileError::LessonNotFound { lesson_id }),
            Some(None) => Err(CompileError::VersionNotFound { lesson_id, version }),
            Some(Some(v)) => Ok(v),
        }
    }

    fn objective_lock(&self, objective_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .objective_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(objective_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn fetch_objective(&self, objective_id: &str) -> Result<Objective, CompileError> {
        match self.graph.fetch_objective_metadata(objective_id).await {
            Ok(Some(objective)) => Ok(objective),
            Ok(None) => Err(CompileError::ObjectiveNotFound {
                objective_id: objective_id.to_string(),
            }),
            Err(e) => Err(CompileError::ServiceUnavailable(format!(
                "knowledge graph: {:#}",
                e
            ))),
        }
    }

    /// Kit lookup failures never fail the run.
    async fn lookup_kit(&self, learner_id: &str, objective_id: &str) -> Option<PreLessonKit> {
        let (learner, objective) = (learner_id.to_string(), objective_id.to_string());
        match self
            .db
            .call(move |db| db.get_kit(&learner, &objective))
            .await
        {
            Ok(kit) => kit,
            Err(e) => {
                tracing::warn!(learner_id, objective_id, error = %format!("{:#}", e), "kit fetch failed, compiling without kit");
                None
            }
        }
    }

    /// Plan from the session, then the plan cache, then a planning call.
    async fn obtain_plan(
        &self,
        session_id: Option<&str>,
        objective: &Objective,
        metalanguage: &str,
        model: &str,
        kit: Option<&PreLessonKit>,
    ) -> LessonPlan {
        if let Some(plan) = session_id
            .and_then(|id| self.sessions.get(id))
            .and_then(|s| s.master)
        {
            return plan;
        }
        if let Some(plan) = self.sessions.cached_plan(&objective.id, &objective.topic).await {
            tracing::debug!(objective_id = %objective.id, "plan cache hit");
            if let Some(id) = session_id {
                self.sessions.set_master(id, plan.clone());
            }
            return plan;
        }
        let plan = self.cards.plan(objective, metalanguage, model, kit).await;
        self.sessions
            .cache_plan(&objective.id, &objective.topic, plan.clone())
            .await;
        if let Some(id) = session_id {
            self.sessions.set_master(id, plan.clone());
        }
        plan
    }

    /// Resolve entities in `text` and link them to the objective. Graph
    /// failures degrade to an empty set; link failures are only logged.
    async fn resolve_and_link(&self, objective_id: &str, text: &str, model: &str) -> ResolvedEntities {
        let resolved = match self.resolver.resolve(text, model).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(objective_id, error = %format!("{:#}", e), "entity resolution failed");
                return ResolvedEntities::default();
            }
        };
        for entity in resolved.words.iter().chain(&resolved.grammar) {
            let kind = RelationKind::for_entity(entity.kind);
            if let Err(e) = self
                .graph
                .write_relationship(objective_id, &entity.id, kind)
                .await
            {
                tracing::warn!(objective_id, entity_id = %entity.id, error = %e, "relationship write failed");
            }
        }
        resolved
    }

    /// Run one stage's generators in sub-order and return its cards.
    async fn run_stage(
        &self,
        stage: Stage,
        inputs: &StageInputs<'_>,
        document: &LessonDocument,
    ) -> Result<Vec<Card>, GenerationError> {
        let mut produced: Vec<Card> = Vec::new();
        let mut entities = ResolvedEntities::default();

        for &kind in stage.cards() {
            let card = {
                let ctx = CardContext {
                    objective: inputs.objective,
                    plan: inputs.plan,
                    metalanguage: inputs.metalanguage,
                    model: inputs.model,
                    kit: inputs.kit,
                    entities: &entities,
                    document,
                };
                self.cards.generate(kind, &ctx, &produced).await?
            };

            let card = match card {
                Card::Objective(c) => {
                    let text = format!(
                        "{}\n{}\n{}\n{}\n{}",
                        c.title,
                        c.summary,
                        inputs.plan.scenario,
                        inputs.plan.target_words.join("\n"),
                        inputs.plan.target_grammar.join("\n")
                    );
                    entities = self
                        .resolve_and_link(&inputs.objective.id, &text, inputs.model)
                        .await;
                    Card::Objective(c)
                }
                Card::Dialogue(mut c) => {
                    let text = c
                        .lines
                        .iter()
                        .map(|l| l.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    let found = self
                        .resolve_and_link(&inputs.objective.id, &text, inputs.model)
                        .await;
                    c.linked_entities = found
                        .words
                        .iter()
                        .chain(&found.grammar)
                        .map(|e| e.id.clone())
                        .collect();
                    Card::Dialogue(c)
                }
                other => other,
            };
            produced.push(card);
        }

        for &kind in stage.cards() {
            if !produced.iter().any(|c| c.kind() == kind) {
                return Err(GenerationError::MalformedOutput(format!(
                    "{} stage produced no {} card",
                    stage, kind
                )));
            }
        }
        Ok(produced)
    }

    /// Compile a lesson, streaming progress through `emitter`.
    ///
    /// The terminal event is always sent: `result` on success, `error`
    /// otherwise. An unknown objective fails before any generation call,
    /// session or version is created.
    pub async fn compile(
        &self,
        request: CompileRequest,
        mut emitter: ProgressEmitter,
    ) -> Result<CompileOutcome, CompileError> {
        match self.run(&request, &mut emitter).await {
            Ok(outcome) => {
                emitter.finish(CompileEvent::Result(outcome.clone())).await;
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(objective_id = %request.objective_id, reason = err.reason(), error = %err, "compilation failed");
                emitter.finish(CompileEvent::error(&err)).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: &CompileRequest,
        emitter: &mut ProgressEmitter,
    ) -> Result<CompileOutcome, CompileError> {
        let objective = self.fetch_objective(&request.objective_id).await?;
        emitter.start(&objective.id).await;

        let lock = self.objective_lock(&objective.id);
        let _guard = lock.lock().await;

        let metalanguage = request
            .metalanguage
            .clone()
            .unwrap_or_else(|| self.config.default_metalanguage.clone());
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        let kit = match (&request.kit, &request.learner_id) {
            (Some(kit), _) => Some(kit.clone()),
            (None, Some(learner_id)) => self.lookup_kit(learner_id, &objective.id).await,
            (None, None) => None,
        }
        .filter(|k| !k.is_empty());
        let kit_context = kit.as_ref().map(build_context);

        let session = self
            .sessions
            .create_or_get(&objective.id, request.learner_id.as_deref());
        let session_id = session.session_id.clone();
        for stage in Stage::ALL {
            self.sessions
                .set_stage_status(&session_id, stage, StageStatus::Pending);
        }

        let plan = self
            .obtain_plan(Some(&session_id), &objective, &metalanguage, &model, kit.as_ref())
            .await;

        let objective_id = objective.id.clone();
        let record = self
            .db
            .call(move |db| db.upsert_lesson_record(&objective_id))
            .await
            .map_err(CompileError::Persistence)?;

        let mut document = LessonDocument::new(&objective.id, &metalanguage, &model);
        if kit.is_some() {
            document.metadata.kit_available = Some(true);
        }

        let inputs = StageInputs {
            objective: &objective,
            plan: &plan,
            metalanguage: &metalanguage,
            model: &model,
            kit: kit_context.as_ref(),
        };

        let mut last_persisted: Option<(i64, LessonDocument)> = None;
        let mut attempted = false;
        for stage in Stage::ALL {
            if emitter.is_cancelled() {
                tracing::info!(objective_id = %objective.id, stage = %stage, "caller went away, skipping remaining stages");
                break;
            }
            if !attempted {
                attempted = true;
                let (lesson_id, lesson_kit) = (record.id, kit.clone());
                self.db
                    .call(move |db| db.set_lesson_kit(lesson_id, lesson_kit.as_ref()))
                    .await
                    .map_err(CompileError::Persistence)?;
            }

            document
                .metadata
                .generation_status
                .set(stage, StageStatus::Generating);
            self.sessions
                .set_stage_status(&session_id, stage, StageStatus::Generating);

            match self.run_stage(stage, &inputs, &document).await {
                Ok(cards) => {
                    document.replace_stage_cards(stage, cards);
                    document
                        .metadata
                        .generation_status
                        .set(stage, StageStatus::Complete);
                    let stored = self
                        .db
                        .persist_version(record.id, &document, self.config.max_conflict_retries)
                        .await?;
                    self.sessions
                        .set_stage_status(&session_id, stage, StageStatus::Complete);
                    self.sessions
                        .set_lesson(&session_id, record.id, stored.version);
                    tracing::info!(objective_id = %objective.id, lesson_id = record.id, stage = %stage, version = stored.version, "stage complete");
                    emitter
                        .emit(CompileEvent::StageReady {
                            stage,
                            version: stored.version,
                            document: document.clone(),
                        })
                        .await;
                    last_persisted = Some((stored.version, document.clone()));
                }
                Err(e) => {
                    let status = StageStatus::failed(e.to_string());
                    document
                        .metadata
                        .generation_status
                        .set(stage, status.clone());
                    self.sessions.set_stage_status(&session_id, stage, status);
                    tracing::warn!(objective_id = %objective.id, stage = %stage, error = %e, "stage failed");
                    emitter
                        .emit(CompileEvent::StageFailed {
                            stage,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }

        if !attempted {
            return self.unchanged_outcome(record.id, document).await;
        }

        let kit_usage = kit.as_ref().map(|k| audit_usage(&document, k));
        if let Some(report) = &kit_usage {
            tracing::info!(
                objective_id = %objective.id,
                usage_percentage = report.usage_percentage,
                all_requirements_met = report.all_requirements_met,
                "kit usage audited"
            );
        }
        document.metadata.kit_usage = kit_usage.clone();

        let version = match last_persisted {
            Some((version, persisted)) if persisted == document => version,
            _ => {
                let stored = self
                    .db
                    .persist_version(record.id, &document, self.config.max_conflict_retries)
                    .await?;
                self.sessions
                    .set_lesson(&session_id, record.id, stored.version);
                stored.version
            }
        };

        Ok(CompileOutcome {
            lesson_id: record.id,
            version,
            document,
            kit_usage,
        })
    }

    /// Outcome for a run that never reached a stage: nothing is written and
    /// the stored current version, if any, is reported instead.
    async fn unchanged_outcome(
        &self,
        lesson_id: i64,
        empty: LessonDocument,
    ) -> Result<CompileOutcome, CompileError> {
        let current = self
            .db
            .call(move |db| db.current_version(lesson_id))
            .await
            .map_err(CompileError::Persistence)?;
        tracing::info!(lesson_id, "run cancelled before any stage, nothing persisted");
        Ok(match current {
            Some(stored) => CompileOutcome {
                lesson_id,
                version: stored.version,
                kit_usage: stored.document.metadata.kit_usage.clone(),
                document: stored.document,
            },
            None => CompileOutcome {
                lesson_id,
                version: 0,
                document: empty,
                kit_usage: None,
            },
        })
    }

    /// Regenerate one stage of a lesson.
    ///
    /// `version` must exist, but the stage is always regenerated against
    /// the current version so work persisted after `version` is kept. Only
    /// `complete` or `failed` stages may be retried. Cards owned by other
    /// stages are carried over unchanged and the kit the lesson was
    /// compiled with is re-applied and re-audited. On success a new version
    /// is appended; on failure nothing is persisted and the failed status
    /// is returned.
    pub async fn retry_stage(
        &self,
        lesson_id: i64,
        version: i64,
        stage: Stage,
    ) -> Result<RetryOutcome, CompileError> {
        let record = self
            .db
            .call(move |db| db.get_lesson(lesson_id))
            .await
            .map_err(CompileError::Persistence)?
            .ok_or(CompileError::LessonNotFound { lesson_id })?;

        let lock = self.objective_lock(&record.objective_id);
        let _guard = lock.lock().await;

        let (requested, current) = self
            .db
            .call(move |db| {
                let requested = db.get_version(lesson_id, version)?.is_some();
                Ok((requested, db.current_version(lesson_id)?))
            })
            .await
            .map_err(CompileError::Persistence)?;
        let base = current
            .filter(|_| requested)
            .ok_or(CompileError::VersionNotFound { lesson_id, version })?;
        if base.version != version {
            tracing::info!(lesson_id, requested = version, current = base.version, stage = %stage, "retrying against current version");
        }
        let base_version = base.version;

        let current = base.document.metadata.generation_status.get(stage).clone();
        if !current.is_retryable() {
            return Err(CompileError::StageNotRetryable {
                stage: stage.to_string(),
                status: current.to_string(),
            });
        }

        let objective = self.fetch_objective(&record.objective_id).await?;
        let mut document = base.document;
        let metalanguage = document.metadata.metalanguage.clone();
        let model = document.metadata.model.clone();

        let session_id = self
            .sessions
            .find_by_lesson(lesson_id)
            .map(|s| s.session_id);
        let kit = self
            .db
            .call(move |db| db.get_lesson_kit(lesson_id))
            .await
            .map_err(CompileError::Persistence)?
            .filter(|k| !k.is_empty());
        let kit_context = kit.as_ref().map(build_context);

        let plan = self
            .obtain_plan(session_id.as_deref(), &objective, &metalanguage, &model, kit.as_ref())
            .await;
        let inputs = StageInputs {
            objective: &objective,
            plan: &plan,
            metalanguage: &metalanguage,
            model: &model,
            kit: kit_context.as_ref(),
        };

        if let Some(id) = &session_id {
            self.sessions
                .set_stage_status(id, stage, StageStatus::Generating);
        }
        tracing::info!(lesson_id, version = base_version, stage = %stage, "retrying stage");

        match self.run_stage(stage, &inputs, &document).await {
            Ok(cards) => {
                document.replace_stage_cards(stage, cards);
                document
                    .metadata
                    .generation_status
                    .set(stage, StageStatus::Complete);
                if let Some(k) = &kit {
                    document.metadata.kit_available = Some(true);
                    document.metadata.kit_usage = Some(audit_usage(&document, k));
                }
                let stored = self
                    .db
                    .persist_version(lesson_id, &document, self.config.max_conflict_retries)
                    .await?;
                if let Some(id) = &session_id {
                    self.sessions
                        .set_stage_status(id, stage, StageStatus::Complete);
                    self.sessions.set_lesson(id, lesson_id, stored.version);
                }
                Ok(RetryOutcome {
                    lesson_id,
                    version: stored.version,
                    stage,
                    status: StageStatus::Complete,
                    document: Some(document),
                })
            }
            Err(e) => {
                let status = StageStatus::failed(e.to_string());
                if let Some(id) = &session_id {
                    self.sessions.set_stage_status(id, stage, status.clone());
                }
                tracing::warn!(lesson_id, stage = %stage, error = %e, "stage retry failed");
                Ok(RetryOutcome {
                    lesson_id,
                    version: base_version,
                    stage,
                    status,
                    document: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::db::LessonDb;
    use crate::compiler::events::channel;
    use crate::compiler::generator::Schema;
    use crate::compiler::generator::scripted::ScriptedGenerator;
    use crate::compiler::graph::InMemoryGraph;
    use crate::compiler::models::{CardKind, Entity, EntityKind, KitWord};
    use crate::compiler::session::SystemClock;
    use std::time::Duration;

    struct Fixture {
        generator: Arc<ScriptedGenerator>,
        graph: Arc<InMemoryGraph>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let generator = Arc::new(ScriptedGenerator::new());
        let graph = Arc::new(InMemoryGraph::new());
        graph
            .add_objective(Objective {
                id: "X:1".into(),
                description: "Can order a drink at a café".into(),
                topic: "café".into(),
                level: None,
                skill: None,
            })
            .unwrap();
        graph
            .add_entity(Entity {
                id: "w-coffee".into(),
                surface: "coffee".into(),
                kind: EntityKind::Word,
                reading: None,
                meaning: None,
                embedding: vec![],
            })
            .unwrap();
        let db = DbHandle::new(LessonDb::new_in_memory().unwrap());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(SystemClock),
            Duration::from_secs(7200),
            Duration::from_secs(3600),
            16,
        ));
        let orchestrator = Orchestrator::new(
            generator.clone(),
            graph.clone(),
            db,
            sessions,
            OrchestratorConfig::default(),
        );
        Fixture {
            generator,
            graph,
            orchestrator,
        }
    }

    async fn compile_collect(
        orchestrator: &Orchestrator,
        request: CompileRequest,
    ) -> (Result<CompileOutcome, CompileError>, Vec<CompileEvent>) {
        let (emitter, mut rx) = channel(64, Duration::ZERO);
        let result = orchestrator.compile(request, emitter).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn test_compile_emits_stages_in_order() {
        let f = fixture();
        let (result, events) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        let names: Vec<String> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "status",
                "content_ready",
                "comprehension_ready",
                "production_ready",
                "interaction_ready",
                "result"
            ]
        );
        assert_eq!(outcome.document.cards.len(), 9);
        assert_eq!(outcome.version, 4);
        assert!(outcome.kit_usage.is_none());
        assert!(outcome.document.metadata.generation_status.all_complete());
    }

    #[tokio::test]
    async fn test_unknown_objective_makes_no_calls() {
        let f = fixture();
        let (result, events) = compile_collect(&f.orchestrator, CompileRequest::new("X:2")).await;
        assert!(matches!(result, Err(CompileError::ObjectiveNotFound { .. })));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "error");
        assert!(f.generator.calls().is_empty());
        assert!(f.orchestrator.sessions().is_empty());
        let found = f
            .orchestrator
            .db()
            .call(|db| db.find_lesson("X:2"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_stage_failure_does_not_stop_later_stages() {
        let f = fixture();
        f.generator.push(
            Schema::Card(CardKind::GuidedDialogue),
            Err(GenerationError::Timeout),
        );
        let (result, events) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        let names: Vec<String> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "status",
                "content_ready",
                "comprehension_ready",
                "production_failed",
                "interaction_ready",
                "result"
            ]
        );
        let status = &outcome.document.metadata.generation_status;
        assert_eq!(status.get(Stage::Production), &StageStatus::failed("timeout"));
        assert!(outcome.document.card(CardKind::GuidedDialogue).is_none());
        assert!(outcome.document.card(CardKind::Drills).is_none());
        assert_eq!(outcome.version, 3);
    }

    #[tokio::test]
    async fn test_plan_cache_short_circuits_planning() {
        let f = fixture();
        compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await.0.unwrap();
        let mut request = CompileRequest::new("X:1");
        request.learner_id = Some("learner-9".into());
        compile_collect(&f.orchestrator, request).await.0.unwrap();
        assert_eq!(f.generator.calls_for(Schema::LessonPlan).len(), 1);
    }

    #[tokio::test]
    async fn test_kit_usage_reported_when_kit_given() {
        let f = fixture();
        let mut request = CompileRequest::new("X:1");
        request.kit = Some(PreLessonKit {
            context: "café".into(),
            words: vec![KitWord {
                surface: "coffee".into(),
                reading: None,
                meaning: None,
            }],
            grammar: vec![],
            phrases: vec![],
        });
        let (result, _) = compile_collect(&f.orchestrator, request).await;
        let outcome = result.unwrap();
        let usage = outcome.kit_usage.unwrap();
        assert_eq!(usage.words.used, vec!["coffee"]);
        assert_eq!(outcome.document.metadata.kit_available, Some(true));
        // The audit changes metadata, so one extra version is written.
        assert_eq!(outcome.version, 5);
    }

    #[tokio::test]
    async fn test_kit_lookup_by_learner() {
        let f = fixture();
        let kit = PreLessonKit {
            context: String::new(),
            words: vec![KitWord {
                surface: "tea".into(),
                reading: None,
                meaning: None,
            }],
            grammar: vec![],
            phrases: vec![],
        };
        f.orchestrator
            .db()
            .call(move |db| db.save_kit("learner-1", "X:1", &kit))
            .await
            .unwrap();
        let mut request = CompileRequest::new("X:1");
        request.learner_id = Some("learner-1".into());
        let (result, _) = compile_collect(&f.orchestrator, request).await;
        assert!(result.unwrap().kit_usage.is_some());
    }

    #[tokio::test]
    async fn test_dialogue_entities_are_linked() {
        let f = fixture();
        f.generator.push(
            Schema::EntityExtraction,
            Ok(serde_json::json!({"words": ["coffee"], "grammar": []})),
        );
        f.generator.push(
            Schema::EntityExtraction,
            Ok(serde_json::json!({"words": ["coffee"], "grammar": []})),
        );
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        match outcome.document.card(CardKind::Dialogue) {
            Some(Card::Dialogue(d)) => assert_eq!(d.linked_entities, vec!["w-coffee"]),
            other => panic!("unexpected dialogue card: {:?}", other),
        }
        assert_eq!(
            f.graph.relationships("X:1").unwrap(),
            vec![("w-coffee".to_string(), "USES_WORD".to_string())]
        );
    }

    async fn cancelled_compile(orchestrator: &Orchestrator) -> CompileOutcome {
        let (emitter, rx) = channel(64, Duration::ZERO);
        drop(rx);
        orchestrator
            .compile(CompileRequest::new("X:1"), emitter)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_cancelled_before_any_stage_persists_nothing() {
        let f = fixture();
        let outcome = cancelled_compile(&f.orchestrator).await;
        assert_eq!(outcome.version, 0);
        assert!(outcome.document.cards.is_empty());
        assert_eq!(
            outcome.document.metadata.generation_status.get(Stage::Content),
            &StageStatus::Pending
        );
        assert!(f.generator.calls_for(Schema::Card(CardKind::Objective)).is_empty());
        assert!(f.orchestrator.history(outcome.lesson_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_current_version_unchanged() {
        let f = fixture();
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let compiled = result.unwrap();

        let outcome = cancelled_compile(&f.orchestrator).await;
        assert_eq!(outcome.version, compiled.version);
        assert_eq!(outcome.document, compiled.document);
        let history = f.orchestrator.history(outcome.lesson_id).await.unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_retry_failed_stage() {
        let f = fixture();
        f.generator.push(
            Schema::Card(CardKind::Drills),
            Err(GenerationError::MalformedOutput("bad".into())),
        );
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        assert!(
            outcome
                .document
                .metadata
                .generation_status
                .get(Stage::Production)
                .is_failed()
        );

        let retry = f
            .orchestrator
            .retry_stage(outcome.lesson_id, outcome.version, Stage::Production)
            .await
            .unwrap();
        assert_eq!(retry.status, StageStatus::Complete);
        assert_eq!(retry.version, outcome.version + 1);
        let doc = retry.document.unwrap();
        assert!(doc.metadata.generation_status.all_complete());
        assert_eq!(doc.card(CardKind::Dialogue), outcome.document.card(CardKind::Dialogue));
    }

    #[tokio::test]
    async fn test_retry_failure_persists_nothing() {
        let f = fixture();
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        f.generator.push(
            Schema::Card(CardKind::Exercises),
            Err(GenerationError::Timeout),
        );
        let retry = f
            .orchestrator
            .retry_stage(outcome.lesson_id, outcome.version, Stage::Interaction)
            .await
            .unwrap();
        assert_eq!(retry.status, StageStatus::failed("timeout"));
        assert_eq!(retry.version, outcome.version);
        let lesson_id = outcome.lesson_id;
        let current = f
            .orchestrator
            .db()
            .call(move |db| db.current_version(lesson_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, outcome.version);
    }

    #[tokio::test]
    async fn test_retry_rejects_pending_stage_and_unknown_ids() {
        let f = fixture();
        let (lesson_id, version) = f
            .orchestrator
            .db()
            .call(|db| {
                let record = db.upsert_lesson_record("X:1")?;
                let mut doc = LessonDocument::new("X:1", "en", "m");
                doc.metadata
                    .generation_status
                    .set(Stage::Content, StageStatus::failed("timeout"));
                db.try_persist_version(record.id, &doc)?;
                Ok((record.id, 1))
            })
            .await
            .unwrap();

        let err = f
            .orchestrator
            .retry_stage(lesson_id, version, Stage::Comprehension)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::StageNotRetryable { .. }));

        let err = f
            .orchestrator
            .retry_stage(999, 1, Stage::Content)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::LessonNotFound { lesson_id: 999 }));

        let err = f
            .orchestrator
            .retry_stage(lesson_id, 42, Stage::Content)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::VersionNotFound { version: 42, .. }));
    }

    #[tokio::test]
    async fn test_retry_against_older_version_keeps_newer_work() {
        let f = fixture();
        f.generator.push(
            Schema::Card(CardKind::GuidedDialogue),
            Err(GenerationError::Timeout),
        );
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.version, 3);

        let first = f
            .orchestrator
            .retry_stage(outcome.lesson_id, 3, Stage::Production)
            .await
            .unwrap();
        assert_eq!(first.version, 4);

        // A second caller still holding version 3.
        let second = f
            .orchestrator
            .retry_stage(outcome.lesson_id, 3, Stage::Interaction)
            .await
            .unwrap();
        assert_eq!(second.version, 5);

        let current = f.orchestrator.current_version(outcome.lesson_id).await.unwrap();
        assert_eq!(current.version, 5);
        let doc = &current.document;
        assert!(doc.metadata.generation_status.all_complete());
        assert!(doc.card(CardKind::GuidedDialogue).is_some());
        assert!(doc.card(CardKind::Drills).is_some());
        assert_eq!(doc.cards.len(), 9);
    }

    #[tokio::test]
    async fn test_retry_failure_reports_current_version() {
        let f = fixture();
        f.generator.push(
            Schema::Card(CardKind::Drills),
            Err(GenerationError::Timeout),
        );
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        f.orchestrator
            .retry_stage(outcome.lesson_id, outcome.version, Stage::Production)
            .await
            .unwrap();

        f.generator.push(
            Schema::Card(CardKind::Culture),
            Err(GenerationError::Timeout),
        );
        let retry = f
            .orchestrator
            .retry_stage(outcome.lesson_id, 1, Stage::Comprehension)
            .await
            .unwrap();
        assert!(retry.status.is_failed());
        assert_eq!(retry.version, outcome.version + 1);
    }

    #[tokio::test]
    async fn test_retry_reapplies_compile_kit() {
        let f = fixture();
        let mut request = CompileRequest::new("X:1");
        request.kit = Some(PreLessonKit {
            context: "café".into(),
            words: vec![
                KitWord {
                    surface: "coffee".into(),
                    reading: None,
                    meaning: None,
                },
                KitWord {
                    surface: "latte".into(),
                    reading: None,
                    meaning: None,
                },
            ],
            grammar: vec![],
            phrases: vec![],
        });
        let (result, _) = compile_collect(&f.orchestrator, request).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.kit_usage.as_ref().unwrap().words.used, vec!["coffee"]);

        f.generator.push(
            Schema::Card(CardKind::Dialogue),
            Ok(serde_json::json!({
                "setting": "A café counter",
                "lines": [
                    {"speaker": "Staff", "text": "What would you like?"},
                    {"speaker": "Guest", "text": "A coffee and a latte, please."}
                ]
            })),
        );
        let retry = f
            .orchestrator
            .retry_stage(outcome.lesson_id, outcome.version, Stage::Comprehension)
            .await
            .unwrap();

        let dialogue_prompts = f.generator.calls_for(Schema::Card(CardKind::Dialogue));
        assert_eq!(dialogue_prompts.len(), 2);
        assert!(dialogue_prompts[1].user_prompt.contains("## Reinforcement kit"));

        let doc = retry.document.unwrap();
        assert_eq!(doc.metadata.kit_available, Some(true));
        let usage = doc.metadata.kit_usage.unwrap();
        assert!(usage.words.used.contains(&"latte".to_string()));
        assert!(usage.words.used.contains(&"coffee".to_string()));
    }

    #[tokio::test]
    async fn test_compile_without_kit_clears_lesson_kit() {
        let f = fixture();
        let mut request = CompileRequest::new("X:1");
        request.kit = Some(PreLessonKit {
            context: String::new(),
            words: vec![KitWord {
                surface: "coffee".into(),
                reading: None,
                meaning: None,
            }],
            grammar: vec![],
            phrases: vec![],
        });
        let outcome = compile_collect(&f.orchestrator, request).await.0.unwrap();
        compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await.0.unwrap();

        let lesson_id = outcome.lesson_id;
        let kit = f
            .orchestrator
            .db()
            .call(move |db| db.get_lesson_kit(lesson_id))
            .await
            .unwrap();
        assert!(kit.is_none());
    }

    #[tokio::test]
    async fn test_objective_locks_are_pruned_when_idle() {
        let f = fixture();
        compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await.0.unwrap();
        let _held = f.orchestrator.objective_lock("X:7");
        let keys: Vec<String> = f
            .orchestrator
            .objective_locks
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["X:7".to_string()]);
    }

    #[tokio::test]
    async fn test_session_reflects_stage_status() {
        let f = fixture();
        f.generator.push(
            Schema::Card(CardKind::Culture),
            Err(GenerationError::Timeout),
        );
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();
        let session = f.orchestrator.sessions().find_by_lesson(outcome.lesson_id).unwrap();
        assert_eq!(session.stages, outcome.document.metadata.generation_status);
        assert_eq!(session.version, Some(outcome.version));
        assert!(session.master.is_some());
    }

    #[tokio::test]
    async fn test_history_and_version_lookup() {
        let f = fixture();
        let (result, _) = compile_collect(&f.orchestrator, CompileRequest::new("X:1")).await;
        let outcome = result.unwrap();

        let history = f.orchestrator.history(outcome.lesson_id).await.unwrap();
        let versions: Vec<i64> = history.iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);

        let stored = f.orchestrator.version(outcome.lesson_id, 4).await.unwrap();
        assert_eq!(stored.document, outcome.document);

        assert!(matches!(
            f.orchestrator.history(77).await.unwrap_err(),
            CompileError::LessonNotFound { lesson_id: 77 }
        ));
        assert!(matches!(
            f.orchestrator.version(outcome.lesson_id, 9).await.unwrap_err(),
            CompileError::VersionNotFound { version: 9, .. }
        ));

        let record = f.orchestrator.lesson_for_objective("X:1").await.unwrap().unwrap();
        assert_eq!(record.id, outcome.lesson_id);
        assert!(f.orchestrator.lesson_for_objective("X:9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_session_requires_known_objective() {
        let f = fixture();
        let session = f
            .orchestrator
            .create_session("X:1", Some("learner-1"))
            .await
            .unwrap();
        assert_eq!(session.learner_id.as_deref(), Some("learner-1"));
        let again = f.orchestrator.create_session("X:1", Some("learner-1")).await.unwrap();
        assert_eq!(again.session_id, session.session_id);

        let err = f.orchestrator.create_session("X:2", None).await.unwrap_err();
        assert!(matches!(err, CompileError::ObjectiveNotFound { .. }));
    }
}
