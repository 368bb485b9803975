use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::process::Command;

use super::models::CardKind;
use crate::errors::GenerationError;

/// Structured output a generation call must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "schema", content = "card")]
pub enum Schema {
    LessonPlan,
    EntityExtraction,
    Card(CardKind),
}

impl Schema {
    pub fn name(&self) -> String {
        match self {
            Self::LessonPlan => "lesson_plan".to_string(),
            Self::EntityExtraction => "entity_extraction".to_string(),
            Self::Card(kind) => format!("card:{}", kind),
        }
    }

    /// JSON shape the model is asked to return.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::LessonPlan => {
                r#"{"topic": str, "scenario": str, "target_words": [str], "target_grammar": [str], "culture_focus": str}"#
            }
            Self::EntityExtraction => r#"{"words": [str], "grammar": [str]}"#,
            Self::Card(kind) => match kind {
                CardKind::Objective => {
                    r#"{"title": str, "summary": str, "success_criteria": [str]}"#
                }
                CardKind::Dialogue => {
                    r#"{"setting": str, "lines": [{"speaker": str, "text": str, "translation": str}]}"#
                }
                CardKind::Reading => {
                    r#"{"title": str, "passage": str, "translation": str, "questions": [{"question": str, "answer": str}]}"#
                }
                CardKind::Vocabulary => {
                    r#"{"entries": [{"surface": str, "reading": str, "meaning": str}]}"#
                }
                CardKind::Grammar => {
                    r#"{"points": [{"pattern": str, "explanation": str, "examples": [str]}]}"#
                }
                CardKind::GuidedDialogue => {
                    r#"{"scenario": str, "turns": [{"prompt": str, "hint": str, "model_answer": str}]}"#
                }
                CardKind::Exercises => {
                    r#"{"items": [{"instruction": str, "prompt": str, "answer": str, "choices": [str]}]}"#
                }
                CardKind::Culture => r#"{"title": str, "note": str, "key_phrases": [str]}"#,
                CardKind::Drills => r#"{"drills": [{"pattern": str, "cue": str, "response": str}]}"#,
            },
        }
    }
}

/// A single call to the generative-text service.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub schema: Schema,
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
}

impl GenerationRequest {
    pub fn new(schema: Schema, model: &str, instructions: &str, user_prompt: String) -> Self {
        let system_prompt = format!(
            "{}\n\nYou MUST respond with valid JSON only (no markdown, no explanation) matching this shape:\n{}",
            instructions,
            schema.shape()
        );
        Self {
            schema,
            system_prompt,
            user_prompt,
            model: model.to_string(),
        }
    }
}

/// Black-box generative-text service: prompt in, JSON out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError>;
}

/// Pull the outermost JSON object out of model output that may be wrapped
/// in a markdown fence or surrounded by commentary.
pub fn extract_json(raw: &str) -> Result<Value, GenerationError> {
    let cleaned = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => {
            return Err(GenerationError::MalformedOutput(format!(
                "no JSON object in response: {}",
                raw.chars().take(120).collect::<String>()
            )));
        }
    };
    serde_json::from_str(cleaned).map_err(|e| GenerationError::MalformedOutput(e.to_string()))
}

/// Decode generated JSON into a typed shape.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, GenerationError> {
    serde_json::from_value(value).map_err(|e| GenerationError::MalformedOutput(e.to_string()))
}

/// Generator backed by an LLM command-line client (`claude --print` style).
pub struct CommandGenerator {
    command: String,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl TextGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError> {
        let mut cmd = Command::new(&self.command);
        cmd.args([
            "--print",
            "--output-format",
            "text",
            "--model",
            &request.model,
            "--system",
            &request.system_prompt,
            "-p",
            &request.user_prompt,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        tracing::debug!(schema = %request.schema.name(), model = %request.model, "generation call");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(GenerationError::Unavailable(format!(
                    "failed to run {}: {}",
                    self.command, e
                )));
            }
            Err(_) => return Err(GenerationError::Timeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::Unavailable(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        extract_json(&String::from_utf8_lossy(&output.stdout))
    }
}
