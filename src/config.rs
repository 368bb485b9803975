//! Configuration for the lesson compiler, read from `lesson.toml`.
//!
//! Layering is file → environment → CLI flags. A missing file means
//! defaults; every field may be omitted.
//!
//! ```toml
//! [server]
//! port = 3142
//! db_path = "lesson.db"
//!
//! [session]
//! ttl_secs = 7200
//! plan_cache_ttl_secs = 3600
//!
//! [generation]
//! command = "claude"
//! timeout_secs = 120
//! default_model = "claude-sonnet"
//!
//! [graph]
//! seed_path = "graph.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::compiler::orchestrator::OrchestratorConfig;
use crate::compiler::resolver::ResolverConfig;

pub const DEFAULT_CONFIG_FILE: &str = "lesson.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Binds 0.0.0.0 and enables permissive CORS.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3142
}

fn default_db_path() -> PathBuf {
    PathBuf::from("lesson.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_plan_cache_ttl")]
    pub plan_cache_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_plan_cache_capacity")]
    pub plan_cache_capacity: u64,
}

fn default_session_ttl() -> u64 {
    2 * 60 * 60
}

fn default_plan_cache_ttl() -> u64 {
    60 * 60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_plan_cache_capacity() -> u64 {
    1024
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            plan_cache_ttl_secs: default_plan_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            plan_cache_capacity: default_plan_cache_capacity(),
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn plan_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    /// LLM command-line client invoked per generation call.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_metalanguage")]
    pub default_metalanguage: String,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_model() -> String {
    "claude-sonnet".to_string()
}

fn default_metalanguage() -> String {
    "en".to_string()
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_secs: default_timeout(),
            default_model: default_model(),
            default_metalanguage: default_metalanguage(),
        }
    }
}

impl GenerationSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

fn default_keepalive() -> u64 {
    15
}

fn default_buffer() -> usize {
    64
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive(),
            buffer: default_buffer(),
        }
    }
}

impl StreamSection {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSection {
    /// JSON seed for the in-memory knowledge graph.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSection {
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_max_conflict_retries() -> u32 {
    5
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

/// Top-level `lesson.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LessonConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub graph: GraphSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
}

impl LessonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse lesson.toml")
    }

    /// Load from `path`, or defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `LESSON_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup("LESSON_GENERATOR_CMD").filter(|v| !v.is_empty()) {
            self.generation.command = cmd;
        }
        if let Some(path) = lookup("LESSON_DB_PATH").filter(|v| !v.is_empty()) {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup("LESSON_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid LESSON_PORT"),
            }
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_model: self.generation.default_model.clone(),
            default_metalanguage: self.generation.default_metalanguage.clone(),
            max_conflict_retries: self.persistence.max_conflict_retries,
            resolver: self.resolver,
        }
    }

    /// Non-fatal problems worth reporting at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.session.plan_cache_ttl_secs > self.session.ttl_secs {
            warnings.push(format!(
                "plan_cache_ttl_secs ({}) exceeds session ttl_secs ({})",
                self.session.plan_cache_ttl_secs, self.session.ttl_secs
            ));
        }
        if self.session.ttl_secs == 0 {
            warnings.push("session ttl_secs is 0: every session expires immediately".to_string());
        }
        if self.stream.keepalive_secs == 0 {
            warnings.push("stream keepalive_secs is 0: keepalive disabled".to_string());
        }
        if self.generation.timeout_secs == 0 {
            warnings.push("generation timeout_secs is 0: every call will time out".to_string());
        }
        if self.persistence.max_conflict_retries == 0 {
            warnings.push("max_conflict_retries is 0: treated as a single attempt".to_string());
        }
        if let Some(seed) = &self.graph.seed_path
            && !seed.exists()
        {
            warnings.push(format!("graph seed_path {} does not exist", seed.display()));
        }

        warnings
    }
}
