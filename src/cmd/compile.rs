//! One-shot compilation: `lesson-compiler compile`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use lesson_compiler::compiler::CompileRequest;
use lesson_compiler::compiler::events::channel;
use lesson_compiler::compiler::models::PreLessonKit;
use lesson_compiler::compiler::server::build_orchestrator;
use lesson_compiler::config::LessonConfig;

pub struct CompileArgs {
    pub objective_id: String,
    pub learner: Option<String>,
    pub kit: Option<PathBuf>,
    pub metalanguage: Option<String>,
    pub model: Option<String>,
}

fn load_kit(path: &Path) -> Result<PreLessonKit> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read kit file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid kit JSON in {}", path.display()))
}

pub async fn cmd_compile(config: &LessonConfig, args: CompileArgs) -> Result<()> {
    let kit = args.kit.as_deref().map(load_kit).transpose()?;
    let orchestrator = build_orchestrator(config)?;

    let request = CompileRequest {
        objective_id: args.objective_id,
        metalanguage: args.metalanguage,
        model: args.model,
        learner_id: args.learner,
        kit,
    };

    let (emitter, mut rx) = channel(config.stream.buffer, config.stream.keepalive());
    let run = tokio::spawn(async move { orchestrator.compile(request, emitter).await });

    while let Some(event) = rx.recv().await {
        println!("{}", event.to_json());
    }

    run.await
        .context("Compile task panicked")?
        .map(|_| ())
        .map_err(anyhow::Error::from)
}
