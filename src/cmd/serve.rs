//! HTTP server command: `lesson-compiler serve`.

use anyhow::Result;

use lesson_compiler::config::LessonConfig;

pub async fn cmd_serve(mut config: LessonConfig, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev_mode = true;
    }
    lesson_compiler::compiler::server::start_server(config).await
}
