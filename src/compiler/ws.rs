use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::api::SharedState;
use super::events::{CompileEvent, channel};
use super::orchestrator::CompileRequest;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a client without query parameters has to send its request frame.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Query form of a [`CompileRequest`]. Kits cannot be passed this way; send
/// the request as the first text frame instead.
#[derive(Debug, Default, Deserialize)]
pub struct CompileQuery {
    pub objective_id: Option<String>,
    pub learner_id: Option<String>,
    pub metalanguage: Option<String>,
    pub model: Option<String>,
}

impl CompileQuery {
    pub fn into_request(self) -> Option<CompileRequest> {
        let objective_id = self.objective_id.filter(|id| !id.trim().is_empty())?;
        Some(CompileRequest {
            objective_id,
            metalanguage: self.metalanguage,
            model: self.model,
            learner_id: self.learner_id,
            kit: None,
        })
    }
}

/// `GET /api/compile/ws`: run a compilation and stream its events.
///
/// Closing the socket cancels the run: the stage in flight finishes and
/// is persisted, later stages are skipped.
pub async fn compile_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<CompileQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: SharedState, query: CompileQuery) {
    let (mut sender, mut receiver) = socket.split();

    let request = match query.into_request() {
        Some(request) => request,
        None => match read_request(&mut receiver).await {
            Ok(request) => request,
            Err(message) => {
                tracing::debug!(%message, "rejecting compile socket");
                let event = CompileEvent::Error {
                    reason: "BadRequest".to_string(),
                    message,
                };
                let _ = sender.send(Message::Text(event.to_json().into())).await;
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        },
    };

    let (emitter, rx) = channel(state.stream_buffer, state.keepalive);
    let orchestrator = state.orchestrator.clone();
    tracing::debug!(objective_id = %request.objective_id, "compile stream opened");
    tokio::spawn(async move {
        // Failures already went out as the terminal error event.
        let _ = orchestrator.compile(request, emitter).await;
    });

    run_socket_loop(sender, receiver, rx).await;
}

/// Wait for the first text frame and parse it as a compile request.
async fn read_request<R>(receiver: &mut R) -> Result<CompileRequest, String>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::time::timeout(REQUEST_TIMEOUT, receiver.next())
            .await
            .map_err(|_| "no compile request received".to_string())?;
        match next {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str::<CompileRequest>(text.as_str())
                    .map_err(|e| format!("invalid compile request: {}", e));
            }
            // Liveness frames may arrive before the request.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => return Err("expected a JSON compile request".to_string()),
            Some(Err(e)) => return Err(format!("socket error: {}", e)),
            None => return Err("socket closed before a request was sent".to_string()),
        }
    }
}

/// Forward compile events to the socket until the terminal event, while
/// ping/pong checks the client is still there. If no Pong arrives within
/// [`PONG_TIMEOUT`] after a Ping, the connection is considered dead.
async fn run_socket_loop<S, R>(mut sender: S, mut receiver: R, mut rx: mpsc::Receiver<CompileEvent>)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("compile socket missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = rx.recv() => {
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                if sender.send(Message::Text(event.to_json().into())).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Dropping rx here is what tells the run its caller went away.
    drop(rx);
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::events::CompileOutcome;
    use crate::compiler::models::LessonDocument;
    use futures::channel::mpsc as fmpsc;

    fn texts(frames: &[Message]) -> Vec<serde_json::Value> {
        frames
            .iter()
            .filter_map(|m| match m {
                Message::Text(t) => Some(serde_json::from_str(t.as_str()).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_query_into_request() {
        let query = CompileQuery {
            objective_id: Some("X:1".into()),
            learner_id: Some("l-1".into()),
            ..Default::default()
        };
        let request = query.into_request().unwrap();
        assert_eq!(request.objective_id, "X:1");
        assert_eq!(request.learner_id.as_deref(), Some("l-1"));
        assert!(request.kit.is_none());

        assert!(CompileQuery::default().into_request().is_none());
        let blank = CompileQuery {
            objective_id: Some("  ".into()),
            ..Default::default()
        };
        assert!(blank.into_request().is_none());
    }

    #[tokio::test]
    async fn test_read_request_from_first_text_frame() {
        let (client_tx, mut client_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        client_tx
            .unbounded_send(Ok(Message::Pong(Default::default())))
            .unwrap();
        client_tx
            .unbounded_send(Ok(Message::Text(
                r#"{"objective_id":"X:1","kit":{"context":"café","words":[{"surface":"coffee"}]}}"#
                    .into(),
            )))
            .unwrap();
        let request = read_request(&mut client_rx).await.unwrap();
        assert_eq!(request.objective_id, "X:1");
        assert_eq!(request.kit.unwrap().words.len(), 1);
    }

    #[tokio::test]
    async fn test_read_request_rejects_garbage_and_early_close() {
        let (client_tx, mut client_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        client_tx
            .unbounded_send(Ok(Message::Text("not json".into())))
            .unwrap();
        assert!(read_request(&mut client_rx).await.unwrap_err().contains("invalid"));

        drop(client_tx);
        assert!(read_request(&mut client_rx).await.unwrap_err().contains("closed"));
    }

    #[tokio::test]
    async fn test_loop_forwards_until_terminal_event() {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<Message>();
        let (_client_tx, client_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (tx, rx) = mpsc::channel(8);

        tx.send(CompileEvent::started("X:1")).await.unwrap();
        tx.send(CompileEvent::Result(CompileOutcome {
            lesson_id: 1,
            version: 4,
            document: LessonDocument::new("X:1", "en", "m"),
            kit_usage: None,
        }))
        .await
        .unwrap();
        tx.send(CompileEvent::Keepalive).await.unwrap();

        run_socket_loop(sink_tx, client_rx, rx).await;

        let frames: Vec<Message> = sink_rx.collect().await;
        let events = texts(&frames);
        let names: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["status", "result"]);
        assert!(matches!(frames.last(), Some(Message::Close(None))));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_client_close_cancels_stream() {
        let (sink_tx, _sink_rx) = fmpsc::unbounded::<Message>();
        let (client_tx, client_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (tx, rx) = mpsc::channel::<CompileEvent>(8);

        client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        run_socket_loop(sink_tx, client_rx, rx).await;
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_closes_socket() {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<Message>();
        let (_client_tx, client_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (_tx, rx) = mpsc::channel::<CompileEvent>(8);

        tokio::time::timeout(
            Duration::from_secs(300),
            run_socket_loop(sink_tx, client_rx, rx),
        )
        .await
        .expect("loop should exit after the pong timeout");

        let frames: Vec<Message> = sink_rx.collect().await;
        let pings = frames
            .iter()
            .filter(|m| matches!(m, Message::Ping(_)))
            .count();
        assert_eq!(pings, 2);
    }
}
