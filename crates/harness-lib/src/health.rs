//! Pipeline health as seen by the runner
//!
//! The pipeline has exactly three components. The runner reports events
//! (a failed poll, an abandoned chunk, a finished pass) and the registry
//! derives each component's condition from them. The binary serves
//! snapshots on its liveness and readiness endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Source,
    Predictor,
    Sink,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Source, Component::Predictor, Component::Sink];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Source => "source",
            Component::Predictor => "predictor",
            Component::Sink => "sink",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    /// Still making progress, but the last attempt at something failed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the component entered its current status
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What one runner pass observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// The pass ended early because the source could not be polled
    pub poll_failed: bool,
    pub attempted: u64,
    /// Records the predictor itself failed (not fetch or validation)
    pub predict_failures: u64,
}

/// Served on `/healthz`
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Status,
    pub serving: bool,
    pub passes: u64,
    pub components: BTreeMap<Component, Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_error: Option<PollError>,
    /// Sequence of the most recent chunk abandoned after its flush retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_chunk: Option<u64>,
}

/// Served on `/readyz`
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct State {
    components: BTreeMap<Component, Condition>,
    serving: bool,
    passes: u64,
    last_poll_error: Option<PollError>,
    last_failed_chunk: Option<u64>,
}

impl State {
    fn set(&mut self, component: Component, status: Status, detail: Option<String>) {
        let now = Utc::now();
        let condition = self.components.entry(component).or_insert(Condition {
            status,
            detail: None,
            since: now,
        });
        if condition.status != status {
            condition.status = status;
            condition.since = now;
        }
        condition.detail = detail;
    }

    fn status(&self) -> Status {
        self.components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(Status::Healthy)
    }
}

/// Shared handle; clones observe the same state
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every component starts healthy; the registry starts not serving
    pub fn new() -> Self {
        let now = Utc::now();
        let components = Component::ALL
            .into_iter()
            .map(|c| {
                (
                    c,
                    Condition {
                        status: Status::Healthy,
                        detail: None,
                        since: now,
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(RwLock::new(State {
                components,
                serving: false,
                passes: 0,
                last_poll_error: None,
                last_failed_chunk: None,
            })),
        }
    }

    pub async fn set(&self, component: Component, status: Status, detail: Option<String>) {
        self.state.write().await.set(component, status, detail);
    }

    pub async fn condition(&self, component: Component) -> Condition {
        let state = self.state.read().await;
        state.components[&component].clone()
    }

    pub async fn set_serving(&self, serving: bool) {
        self.state.write().await.serving = serving;
    }

    pub async fn poll_failed(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.write().await;
        state.set(Component::Source, Status::Degraded, Some(message.clone()));
        state.last_poll_error = Some(PollError {
            message,
            at: Utc::now(),
        });
    }

    /// A pass returned without a fatal error
    ///
    /// The source recovers only when the pass polled cleanly. The predictor
    /// is degraded when it failed every record it was given.
    pub async fn pass_finished(&self, report: PassReport) {
        let mut state = self.state.write().await;
        state.passes += 1;
        if !report.poll_failed {
            state.set(Component::Source, Status::Healthy, None);
        }
        if report.attempted > 0 {
            if report.predict_failures >= report.attempted {
                let detail = format!(
                    "all {} predictions in the last pass failed",
                    report.attempted
                );
                state.set(Component::Predictor, Status::Degraded, Some(detail));
            } else {
                state.set(Component::Predictor, Status::Healthy, None);
            }
        }
    }

    pub async fn chunk_flushed(&self) {
        self.set(Component::Sink, Status::Healthy, None).await;
    }

    pub async fn chunk_abandoned(&self, sequence: u64, reason: impl Into<String>) {
        let mut state = self.state.write().await;
        state.set(Component::Sink, Status::Degraded, Some(reason.into()));
        state.last_failed_chunk = Some(sequence);
    }

    /// Permanent sink error; the runner stops after this
    pub async fn sink_failed(&self, reason: impl Into<String>) {
        self.set(Component::Sink, Status::Unhealthy, Some(reason.into()))
            .await;
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.read().await;
        HealthSnapshot {
            status: state.status(),
            serving: state.serving,
            passes: state.passes,
            components: state.components.clone(),
            last_poll_error: state.last_poll_error.clone(),
            last_failed_chunk: state.last_failed_chunk,
        }
    }

    pub async fn readiness(&self) -> Readiness {
        let state = self.state.read().await;
        let reason = if !state.serving {
            Some("runner is not serving".to_string())
        } else {
            state
                .components
                .iter()
                .find(|(_, c)| c.status == Status::Unhealthy)
                .map(|(component, c)| match &c.detail {
                    Some(detail) => format!("{} unhealthy: {}", component, detail),
                    None => format!("{} unhealthy", component),
                })
        };
        Readiness {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_healthy_and_not_serving() {
        let registry = HealthRegistry::new();
        let snapshot = registry.snapshot().await;

        assert_eq!(snapshot.status, Status::Healthy);
        assert_eq!(snapshot.components.len(), 3);
        assert!(!snapshot.serving);
        assert!(snapshot.last_poll_error.is_none());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("runner is not serving"));
    }

    #[tokio::test]
    async fn test_poll_failure_survives_a_pass_that_hit_it() {
        let registry = HealthRegistry::new();
        registry.poll_failed("queue unreachable").await;
        registry
            .pass_finished(PassReport {
                poll_failed: true,
                ..Default::default()
            })
            .await;

        let source = registry.condition(Component::Source).await;
        assert_eq!(source.status, Status::Degraded);
        assert_eq!(source.detail.as_deref(), Some("queue unreachable"));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.status, Status::Degraded);
        assert_eq!(snapshot.passes, 1);
        assert_eq!(
            snapshot.last_poll_error.map(|e| e.message).as_deref(),
            Some("queue unreachable")
        );
    }

    #[tokio::test]
    async fn test_clean_pass_recovers_source_but_keeps_last_error() {
        let registry = HealthRegistry::new();
        registry.poll_failed("queue unreachable").await;
        registry.pass_finished(PassReport::default()).await;

        assert_eq!(
            registry.condition(Component::Source).await.status,
            Status::Healthy
        );
        assert!(registry.snapshot().await.last_poll_error.is_some());
    }

    #[tokio::test]
    async fn test_predictor_degrades_only_when_every_record_fails() {
        let registry = HealthRegistry::new();
        registry
            .pass_finished(PassReport {
                attempted: 4,
                predict_failures: 3,
                ..Default::default()
            })
            .await;
        assert_eq!(
            registry.condition(Component::Predictor).await.status,
            Status::Healthy
        );

        registry
            .pass_finished(PassReport {
                attempted: 4,
                predict_failures: 4,
                ..Default::default()
            })
            .await;
        let predictor = registry.condition(Component::Predictor).await;
        assert_eq!(predictor.status, Status::Degraded);
        assert!(predictor.detail.unwrap().contains("all 4"));

        // An idle pass says nothing about the predictor
        registry.pass_finished(PassReport::default()).await;
        assert_eq!(
            registry.condition(Component::Predictor).await.status,
            Status::Degraded
        );
    }

    #[tokio::test]
    async fn test_abandoned_chunk_is_remembered_after_recovery() {
        let registry = HealthRegistry::new();
        registry.chunk_abandoned(7, "table unavailable").await;
        assert_eq!(
            registry.condition(Component::Sink).await.status,
            Status::Degraded
        );

        registry.chunk_flushed().await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.components[&Component::Sink].status, Status::Healthy);
        assert_eq!(snapshot.last_failed_chunk, Some(7));
    }

    #[tokio::test]
    async fn test_since_moves_only_on_status_change() {
        let registry = HealthRegistry::new();
        registry.chunk_abandoned(1, "first").await;
        let first = registry.condition(Component::Sink).await;
        registry.chunk_abandoned(2, "second").await;
        let second = registry.condition(Component::Sink).await;

        assert_eq!(first.since, second.since);
        assert_eq!(second.detail.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_unhealthy_sink_blocks_readiness() {
        let registry = HealthRegistry::new();
        registry.set_serving(true).await;
        assert!(registry.readiness().await.ready);

        registry.sink_failed("header mismatch").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("sink unhealthy: header mismatch")
        );
        assert_eq!(registry.snapshot().await.status, Status::Unhealthy);
    }

    #[test]
    fn test_snapshot_serializes_component_names() {
        let mut components = BTreeMap::new();
        components.insert(
            Component::Predictor,
            Condition {
                status: Status::Degraded,
                detail: None,
                since: Utc::now(),
            },
        );
        let snapshot = HealthSnapshot {
            status: Status::Degraded,
            serving: true,
            passes: 2,
            components,
            last_poll_error: None,
            last_failed_chunk: None,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["components"]["predictor"]["status"], "degraded");
        assert!(json.get("last_poll_error").is_none());
    }
}
