//! Staged lesson compilation.
//!
//! | Module         | Role                                                    |
//! |----------------|---------------------------------------------------------|
//! | `models`       | Stages, statuses, cards, documents, kits, objectives    |
//! | `generator`    | `TextGenerator` seam and the LLM CLI implementation     |
//! | `graph`        | `KnowledgeGraph` seam and the in-memory graph           |
//! | `resolver`     | Entity Resolver: text → known words and grammar         |
//! | `kit`          | Kit context for prompts and the usage audit             |
//! | `cards`        | Plan and per-card generation                            |
//! | `session`      | Sessions, TTL expiry, plan cache                        |
//! | `events`       | Progress events and the emitter                         |
//! | `db`           | SQLite persistence of lessons, versions and kits        |
//! | `orchestrator` | Stage sequencing, retry, version writes                 |
//! | `api`          | HTTP routes                                             |
//! | `ws`           | WebSocket progress stream                               |
//! | `server`       | Wiring, startup and shutdown                            |

pub mod api;
pub mod cards;
pub mod db;
pub mod events;
pub mod generator;
pub mod graph;
pub mod kit;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod server;
pub mod session;
pub mod ws;

pub use events::{CompileEvent, CompileOutcome, ProgressEmitter};
pub use orchestrator::{CompileRequest, Orchestrator, OrchestratorConfig, RetryOutcome};
