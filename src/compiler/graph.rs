use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::{Entity, Objective, RelationKind};

/// Knowledge-graph operations the pipeline depends on.
///
/// `NotFound` is modelled as `Ok(None)`; `Err` means the store itself failed.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn fetch_objective_metadata(&self, id: &str) -> Result<Option<Objective>>;

    async fn lookup_entity(&self, surface_form: &str) -> Result<Option<Entity>>;

    async fn write_relationship(
        &self,
        objective_id: &str,
        entity_id: &str,
        kind: RelationKind,
    ) -> Result<()>;

    /// Entities whose embedding has cosine similarity >= `threshold`,
    /// best first, at most `k`.
    async fn vector_similarity_search(
        &self,
        embedding: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(String, f32)>>;
}

/// On-disk seed format for [`InMemoryGraph`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSeed {
    #[serde(default)]
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Default)]
struct GraphData {
    objectives: HashMap<String, Objective>,
    /// Keyed by surface form.
    entities: HashMap<String, Entity>,
    relationships: BTreeSet<(String, String, &'static str)>,
}

/// Process-local knowledge graph, used by the CLI and tests.
#[derive(Default)]
pub struct InMemoryGraph {
    data: RwLock<GraphData>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: GraphSeed) -> Self {
        let graph = Self::new();
        {
            let mut data = graph.data.write().unwrap_or_else(|e| e.into_inner());
            for objective in seed.objectives {
                data.objectives.insert(objective.id.clone(), objective);
            }
            for entity in seed.entities {
                data.entities.insert(entity.surface.clone(), entity);
            }
        }
        graph
    }

    /// Load a JSON seed file (`{"objectives": [...], "entities": [...]}`).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph seed: {}", path.display()))?;
        let seed: GraphSeed =
            serde_json::from_str(&content).context("Failed to parse graph seed JSON")?;
        Ok(Self::from_seed(seed))
    }

    pub fn add_objective(&self, objective: Objective) -> Result<()> {
        let mut data = self.data.write().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        data.objectives.insert(objective.id.clone(), objective);
        Ok(())
    }

    pub fn add_entity(&self, entity: Entity) -> Result<()> {
        let mut data = self.data.write().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        data.entities.insert(entity.surface.clone(), entity);
        Ok(())
    }

    /// Relationships written for an objective, as `(entity_id, kind)`.
    pub fn relationships(&self, objective_id: &str) -> Result<Vec<(String, String)>> {
        let data = self.data.read().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        Ok(data
            .relationships
            .iter()
            .filter(|(obj, _, _)| obj == objective_id)
            .map(|(_, entity, kind)| (entity.clone(), kind.to_string()))
            .collect())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl KnowledgeGraph for InMemoryGraph {
    async fn fetch_objective_metadata(&self, id: &str) -> Result<Option<Objective>> {
        let data = self.data.read().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        Ok(data.objectives.get(id).cloned())
    }

    async fn lookup_entity(&self, surface_form: &str) -> Result<Option<Entity>> {
        let data = self.data.read().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        Ok(data.entities.get(surface_form.trim()).cloned())
    }

    async fn write_relationship(
        &self,
        objective_id: &str,
        entity_id: &str,
        kind: RelationKind,
    ) -> Result<()> {
        let mut data = self.data.write().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        if !data.objectives.contains_key(objective_id) {
            anyhow::bail!("Objective {} not in graph", objective_id);
        }
        data.relationships.insert((
            objective_id.to_string(),
            entity_id.to_string(),
            kind.as_str(),
        ));
        Ok(())
    }

    async fn vector_similarity_search(
        &self,
        embedding: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(String, f32)>> {
        let data = self.data.read().map_err(|e| anyhow!("Graph lock poisoned: {}", e))?;
        let mut scored: Vec<(String, f32)> = data
            .entities
            .values()
            .filter(|e| !e.embedding.is_empty())
            .map(|e| (e.id.clone(), cosine_similarity(embedding, &e.embedding)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}
