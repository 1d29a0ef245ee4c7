//! Per-run log relay: normalizes raw agent output into typed events, keeps a
//! bounded backfill window, and fans events out to any number of subscribers.
//!
//! Events are ephemeral. A subscriber that falls behind the broadcast queue
//! skips ahead rather than slowing the producer; the sequence number lets it
//! detect the gap. Only the final status recorded in the run ledger is
//! durable.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use db::models::run::RunStatus;
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum LogEventKind {
    Content {
        text: String,
    },
    ToolCall {
        tool: String,
        input: Value,
    },
    ToolResult {
        tool: String,
        output: Value,
    },
    Status {
        status: String,
        error: Option<String>,
        artifact: Option<String>,
    },
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "sequence")]
    pub seq: u64,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub kind: LogEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome reported by the agent itself through a `status` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    Done { artifact: Option<String> },
    Failed { error: Option<String> },
}

/// One raw line of agent output. Agents emit JSON lines tagged with `type`;
/// anything that does not parse is plain content.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawAgentLine {
    Content {
        text: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool: String,
        #[serde(default)]
        output: Value,
    },
    Status {
        status: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        artifact: Option<String>,
    },
}

pub struct LogRelay {
    run_id: Uuid,
    capacity: usize,
    inner: Mutex<RelayInner>,
}

struct RelayInner {
    next_seq: u64,
    buffer: VecDeque<LogEvent>,
    /// Dropped on finish, which ends every live subscription.
    sender: Option<broadcast::Sender<LogEvent>>,
}

impl LogRelay {
    pub fn new(run_id: Uuid, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            run_id,
            capacity,
            inner: Mutex::new(RelayInner {
                next_seq: 0,
                buffer: VecDeque::with_capacity(capacity),
                sender: Some(sender),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    /// Normalize one raw output line into an event. Returns the terminal
    /// signal when the line was an agent `status` report.
    pub fn push_line(&self, line: &str) -> Option<AgentSignal> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (kind, signal) = match serde_json::from_str::<RawAgentLine>(trimmed) {
            Ok(RawAgentLine::Content { text }) => (LogEventKind::Content { text }, None),
            Ok(RawAgentLine::ToolCall { tool, input }) => {
                (LogEventKind::ToolCall { tool, input }, None)
            }
            Ok(RawAgentLine::ToolResult { tool, output }) => {
                (LogEventKind::ToolResult { tool, output }, None)
            }
            Ok(RawAgentLine::Status {
                status,
                error,
                artifact,
            }) => {
                let signal = match status.as_str() {
                    "done" => Some(AgentSignal::Done {
                        artifact: artifact.clone(),
                    }),
                    "failed" => Some(AgentSignal::Failed {
                        error: error.clone(),
                    }),
                    _ => None,
                };
                (
                    LogEventKind::Status {
                        status,
                        error,
                        artifact,
                    },
                    signal,
                )
            }
            Err(_) => (
                LogEventKind::Content {
                    text: line.to_string(),
                },
                None,
            ),
        };
        self.emit(kind);
        signal
    }

    /// Snapshot of the buffered window chained with live events. The seq
    /// numbers seen by one subscription are strictly increasing; events in
    /// the snapshot are never delivered twice.
    pub fn subscribe(&self) -> BoxStream<'static, LogEvent> {
        let (snapshot, receiver) = {
            let inner = self.lock();
            let snapshot: Vec<LogEvent> = inner.buffer.iter().cloned().collect();
            let receiver = inner.sender.as_ref().map(|s| s.subscribe());
            (snapshot, receiver)
        };
        let cutoff = snapshot.last().map(|event| event.seq);
        let backfill = futures::stream::iter(snapshot);
        match receiver {
            None => backfill.boxed(),
            Some(receiver) => {
                let live = BroadcastStream::new(receiver).filter_map(move |item| {
                    futures::future::ready(match item {
                        Ok(event) if cutoff.is_some_and(|c| event.seq <= c) => None,
                        Ok(event) => Some(event),
                        // Lagged receivers skip ahead; the seq gap is visible
                        // to the client.
                        Err(BroadcastStreamRecvError::Lagged(_)) => None,
                    })
                });
                backfill.chain(live).boxed()
            }
        }
    }

    /// Emit the final status event and close the relay. Live subscriptions
    /// end; later subscribers still get the buffered tail.
    pub fn finish(&self, status: RunStatus, error: Option<String>, artifact: Option<String>) {
        let mut inner = self.lock();
        if inner.sender.is_none() {
            return;
        }
        let event = Self::next_event(
            self.run_id,
            &mut inner,
            LogEventKind::Status {
                status: status.to_string(),
                error,
                artifact,
            },
        );
        Self::buffer_and_send(self.capacity, &mut inner, event);
        inner.sender = None;
    }

    /// Periodic heartbeat so subscribers can tell a quiet run from a dead
    /// connection. The task ends itself once the relay is closed.
    pub fn spawn_heartbeat(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let relay = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if relay.is_closed() {
                    break;
                }
                relay.emit(LogEventKind::Heartbeat);
            }
        })
    }

    fn emit(&self, kind: LogEventKind) {
        let mut inner = self.lock();
        if inner.sender.is_none() {
            return;
        }
        let event = Self::next_event(self.run_id, &mut inner, kind);
        Self::buffer_and_send(self.capacity, &mut inner, event);
    }

    fn next_event(run_id: Uuid, inner: &mut RelayInner, kind: LogEventKind) -> LogEvent {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        LogEvent {
            seq,
            run_id,
            kind,
            timestamp: Utc::now(),
        }
    }

    fn buffer_and_send(capacity: usize, inner: &mut RelayInner, event: LogEvent) {
        if inner.buffer.len() == capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(event.clone());
        if let Some(sender) = &inner.sender {
            // No receivers is fine; the buffer still records the event.
            let _ = sender.send(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(capacity: usize) -> LogRelay {
        LogRelay::new(Uuid::new_v4(), capacity)
    }

    #[test]
    fn normalizes_json_lines_and_surfaces_status_signal() {
        let relay = relay(16);

        let signal =
            relay.push_line(r#"{"type":"tool_call","tool":"bash","input":{"cmd":"ls"}}"#);
        assert_eq!(signal, None);

        let signal = relay.push_line("plain stderr noise");
        assert_eq!(signal, None);

        let signal = relay.push_line(r#"{"type":"status","status":"done","artifact":"out/diff"}"#);
        assert_eq!(
            signal,
            Some(AgentSignal::Done {
                artifact: Some("out/diff".to_string())
            })
        );

        let inner = relay.lock();
        let kinds: Vec<_> = inner.buffer.iter().map(|e| &e.kind).collect();
        assert!(matches!(kinds[0], LogEventKind::ToolCall { tool, .. } if tool == "bash"));
        assert!(matches!(kinds[1], LogEventKind::Content { text } if text == "plain stderr noise"));
        assert!(matches!(kinds[2], LogEventKind::Status { status, .. } if status == "done"));
    }

    #[test]
    fn failed_status_carries_error() {
        let relay = relay(16);
        let signal = relay.push_line(r#"{"type":"status","status":"failed","error":"boom"}"#);
        assert_eq!(
            signal,
            Some(AgentSignal::Failed {
                error: Some("boom".to_string())
            })
        );
    }

    #[tokio::test]
    async fn late_subscriber_gets_backfill_then_live_without_duplicates() {
        let relay = Arc::new(relay(64));
        for i in 0..5 {
            relay.push_line(&format!("line {i}"));
        }

        let stream = relay.subscribe();

        for i in 5..8 {
            relay.push_line(&format!("line {i}"));
        }
        relay.finish(RunStatus::Done, None, None);

        let events: Vec<LogEvent> = stream.collect().await;
        assert_eq!(events.len(), 9);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
        }
        assert!(matches!(
            &events[8].kind,
            LogEventKind::Status { status, .. } if status == "done"
        ));
    }

    #[tokio::test]
    async fn subscriber_after_finish_gets_buffered_tail_and_ends() {
        let relay = relay(4);
        for i in 0..10 {
            relay.push_line(&format!("line {i}"));
        }
        relay.finish(RunStatus::Stopped, None, None);
        assert!(relay.is_closed());

        // The stream must end on its own, not hang.
        let events: Vec<LogEvent> = relay.subscribe().collect().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);
        assert!(matches!(
            &events[3].kind,
            LogEventKind::Status { status, .. } if status == "stopped"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_tick_until_finish_closes_the_relay() {
        let relay = Arc::new(relay(16));
        let heartbeat = relay.clone().spawn_heartbeat(Duration::from_secs(15));
        let stream = relay.subscribe();

        tokio::time::sleep(Duration::from_secs(46)).await;
        relay.finish(RunStatus::Done, None, None);
        // The task notices the closed relay on its next tick and ends.
        heartbeat.await.unwrap();

        let events: Vec<LogEvent> = stream.collect().await;
        let beats = events
            .iter()
            .filter(|e| matches!(e.kind, LogEventKind::Heartbeat))
            .count();
        assert_eq!(beats, 3);
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[3].kind,
            LogEventKind::Status { status, .. } if status == "done"
        ));
    }

    #[test]
    fn finish_is_idempotent_and_emits_nothing_after_close() {
        let relay = relay(16);
        relay.finish(RunStatus::Failed, Some("x".to_string()), None);
        relay.finish(RunStatus::Done, None, None);
        relay.push_line("dropped");
        let inner = relay.lock();
        assert_eq!(inner.buffer.len(), 1);
    }

    #[test]
    fn wire_shape_is_stable() {
        let event = LogEvent {
            seq: 7,
            run_id: Uuid::nil(),
            kind: LogEventKind::ToolCall {
                tool: "bash".to_string(),
                input: serde_json::json!({"cmd": "ls"}),
            },
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["kind"], "tool_call");
        assert_eq!(value["payload"]["tool"], "bash");
        assert!(value.get("timestamp").is_some());

        let heartbeat = LogEvent {
            seq: 8,
            run_id: Uuid::nil(),
            kind: LogEventKind::Heartbeat,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(value["kind"], "heartbeat");
        assert!(value.get("payload").is_none());
    }
}
