//! Progress Emitter: the ordered event stream of one compilation run.
//!
//! Order per run: `status(started)`, interleaved `keepalive`s, one
//! `{stage}_ready` or `{stage}_failed` per attempted stage, then exactly one
//! terminal `result` or `error`. The keepalive task is stopped before the
//! terminal event is sent, so nothing follows it.

use std::time::Duration;

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::models::{KitUsageReport, LessonDocument, Stage};
use crate::errors::CompileError;

/// Final output of a successful run; also the synchronous compile response.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompileOutcome {
    pub lesson_id: i64,
    pub version: i64,
    pub document: LessonDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit_usage: Option<KitUsageReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileEvent {
    Status {
        state: String,
        objective_id: String,
    },
    Keepalive,
    StageReady {
        stage: Stage,
        version: i64,
        document: LessonDocument,
    },
    StageFailed {
        stage: Stage,
        reason: String,
    },
    Result(CompileOutcome),
    Error {
        reason: String,
        message: String,
    },
}

impl CompileEvent {
    pub fn started(objective_id: &str) -> Self {
        Self::Status {
            state: "started".to_string(),
            objective_id: objective_id.to_string(),
        }
    }

    pub fn error(err: &CompileError) -> Self {
        Self::Error {
            reason: err.reason().to_string(),
            message: err.to_string(),
        }
    }

    /// Wire name: `status`, `keepalive`, `content_ready`, `production_failed`, ...
    pub fn name(&self) -> String {
        match self {
            Self::Status { .. } => "status".to_string(),
            Self::Keepalive => "keepalive".to_string(),
            Self::StageReady { stage, .. } => format!("{}_ready", stage),
            Self::StageFailed { stage, .. } => format!("{}_failed", stage),
            Self::Result(_) => "result".to_string(),
            Self::Error { .. } => "error".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error { .. })
    }

    fn data(&self) -> Value {
        match self {
            Self::Status {
                state,
                objective_id,
            } => json!({ "state": state, "objective_id": objective_id }),
            Self::Keepalive => Value::Null,
            Self::StageReady {
                stage,
                version,
                document,
            } => json!({ "stage": stage, "version": version, "document": document }),
            Self::StageFailed { stage, reason } => json!({ "stage": stage, "reason": reason }),
            Self::Result(outcome) => serde_json::to_value(outcome).unwrap_or(Value::Null),
            Self::Error { reason, message } => json!({ "reason": reason, "message": message }),
        }
    }

    /// `{"event": <name>, "data": <payload>}` as a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, event = %self.name(), "failed to serialize event");
            String::from("{\"event\":\"error\",\"data\":null}")
        })
    }
}

impl Serialize for CompileEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("CompileEvent", 2)?;
        s.serialize_field("event", &self.name())?;
        s.serialize_field("data", &self.data())?;
        s.end()
    }
}

/// Publisher side of a run's event stream.
///
/// A closed receiver means the caller went away: further events are
/// dropped and [`ProgressEmitter::is_cancelled`] turns true, which the
/// orchestrator checks before starting each stage.
pub struct ProgressEmitter {
    tx: Option<mpsc::Sender<CompileEvent>>,
    keepalive: Option<JoinHandle<()>>,
    keepalive_interval: Duration,
}

/// Create an emitter and the subscriber end of its stream.
pub fn channel(buffer: usize, keepalive_interval: Duration) -> (ProgressEmitter, mpsc::Receiver<CompileEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        ProgressEmitter {
            tx: Some(tx),
            keepalive: None,
            keepalive_interval,
        },
        rx,
    )
}

impl ProgressEmitter {
    /// Emitter with no subscriber, for synchronous callers. Never cancelled.
    pub fn detached() -> Self {
        Self {
            tx: None,
            keepalive: None,
            keepalive_interval: Duration::ZERO,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Send an event; returns false when the subscriber is gone.
    pub async fn emit(&self, event: CompileEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => true,
        }
    }

    /// Emit `status(started)` and start the keepalive heartbeat.
    pub async fn start(&mut self, objective_id: &str) {
        self.emit(CompileEvent::started(objective_id)).await;
        let Some(tx) = self.tx.clone() else {
            return;
        };
        if self.keepalive_interval.is_zero() {
            return;
        }
        let period = self.keepalive_interval;
        self.keepalive = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(CompileEvent::Keepalive).await.is_err() {
                    break;
                }
            }
        }));
    }

    async fn stop_keepalive(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Stop the heartbeat and send the terminal event.
    pub async fn finish(mut self, event: CompileEvent) -> bool {
        debug_assert!(event.is_terminal());
        self.stop_keepalive().await;
        self.emit(event).await
    }
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }
}
