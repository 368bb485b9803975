//! Stored-lesson commands: `lesson-compiler retry` and `lesson-compiler history`.

use std::str::FromStr;

use anyhow::{Result, anyhow};

use lesson_compiler::compiler::models::Stage;
use lesson_compiler::compiler::server::build_orchestrator;
use lesson_compiler::config::LessonConfig;

pub async fn cmd_retry(config: &LessonConfig, lesson_id: i64, version: i64, stage: &str) -> Result<()> {
    let stage = Stage::from_str(stage).map_err(|e| anyhow!(e))?;
    let orchestrator = build_orchestrator(config)?;
    let outcome = orchestrator.retry_stage(lesson_id, version, stage).await?;

    if outcome.status.is_complete() {
        println!(
            "Lesson {} stage {} regenerated as version {}",
            lesson_id, stage, outcome.version
        );
    } else {
        println!(
            "Lesson {} stage {} failed again ({}); latest version is still {}",
            lesson_id, stage, outcome.status, outcome.version
        );
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

pub async fn cmd_history(config: &LessonConfig, objective_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let Some(record) = orchestrator.lesson_for_objective(objective_id).await? else {
        println!("No lesson compiled for {}", objective_id);
        return Ok(());
    };

    let versions = orchestrator.history(record.id).await?;
    println!();
    println!("Lesson {} ({})", record.id, record.objective_id);
    println!("==========================");
    for summary in &versions {
        let stages: Vec<String> = summary
            .generation_status
            .iter()
            .map(|(stage, status)| format!("{}={}", stage, status))
            .collect();
        println!("  v{:<3} {}  {}", summary.version, summary.created_at, stages.join("  "));
    }
    println!();
    println!("{} version(s)", versions.len());
    Ok(())
}
