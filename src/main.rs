use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lesson_compiler::config::{DEFAULT_CONFIG_FILE, LessonConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "lesson-compiler")]
#[command(version, about = "Compile learning objectives into versioned lesson documents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Path to lesson.toml (missing file means defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and compile stream
    Serve {
        /// Port to serve on (overrides lesson.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (bind 0.0.0.0, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Compile a lesson, printing one JSON event per line
    Compile {
        objective_id: String,

        /// Learner whose stored kit should be used
        #[arg(long)]
        learner: Option<String>,

        /// JSON file with a pre-lesson kit (overrides the stored kit)
        #[arg(long)]
        kit: Option<PathBuf>,

        #[arg(long)]
        metalanguage: Option<String>,

        #[arg(long)]
        model: Option<String>,
    },
    /// Regenerate one stage of a stored lesson version
    Retry {
        lesson_id: i64,
        version: i64,
        /// content, comprehension, production or interaction
        stage: String,
    },
    /// Show the version history of an objective's lesson
    History { objective_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Warning: failed to load .env: {}", e);
    }
    lesson_compiler::logging::init(cli.verbose, cli.json_logs);

    let mut config = LessonConfig::load_or_default(&cli.config)?;
    config.apply_env();
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    match cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(config, port, dev).await,
        Commands::Compile {
            objective_id,
            learner,
            kit,
            metalanguage,
            model,
        } => {
            cmd::cmd_compile(
                &config,
                cmd::CompileArgs {
                    objective_id,
                    learner,
                    kit,
                    metalanguage,
                    model,
                },
            )
            .await
        }
        Commands::Retry {
            lesson_id,
            version,
            stage,
        } => cmd::cmd_retry(&config, lesson_id, version, &stage).await,
        Commands::History { objective_id } => cmd::cmd_history(&config, &objective_id).await,
    }
}
