//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `compile` | `Compile`        |
//! | `lesson`  | `Retry`, `History` |

pub mod compile;
pub mod lesson;
pub mod serve;

pub use compile::{CompileArgs, cmd_compile};
pub use lesson::{cmd_history, cmd_retry};
pub use serve::cmd_serve;
