//! Ask lifecycle: the request state machine and its orchestrator
//!
//! One Ask is one end-to-end natural-language-question-to-result request.
//! Each runs on its own task, strictly ordered within itself and unordered
//! against other Asks. Terminal states are immutable; cancellation marks the
//! Ask stopped and discards the results of whatever calls were in flight.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::correction::SqlCorrectionPipeline;
use crate::datasource::DataSourceDescriptor;
use crate::dialect::dialect_adapter;
use crate::generation::SqlGenerationPipeline;
use crate::pool::{ConnectionRegistry, QueryResult, execute};
use crate::safety;
use crate::schema::SchemaIntrospector;

/// One prior question/SQL pair carried as conversation context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskHistoryTurn {
    pub question: String,
    pub sql: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AskStatus {
    Submitted,
    Generating,
    Executing,
    Correcting,
    Completed,
    Failed,
    Stopped,
}

impl AskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AskStatus::Completed | AskStatus::Failed | AskStatus::Stopped
        )
    }

    /// Legal forward edges of the state machine. `Stopped` is reachable from
    /// any non-terminal state; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: AskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == AskStatus::Stopped {
            return true;
        }
        matches!(
            (self, next),
            (AskStatus::Submitted, AskStatus::Generating)
                | (AskStatus::Generating, AskStatus::Executing)
                | (AskStatus::Generating, AskStatus::Failed)
                | (AskStatus::Executing, AskStatus::Correcting)
                | (AskStatus::Executing, AskStatus::Completed)
                | (AskStatus::Executing, AskStatus::Failed)
                | (AskStatus::Correcting, AskStatus::Executing)
                | (AskStatus::Correcting, AskStatus::Failed)
        )
    }
}

/// Snapshot of one Ask, mutated only by the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct AskRequest {
    pub id: Uuid,
    pub question: String,
    pub data_source_id: String,
    pub history: Vec<AskHistoryTurn>,
    pub status: AskStatus,
    pub generated_sql: Option<String>,
    pub result: Option<QueryResult>,
    pub error: Option<String>,
    pub confidence: Option<f32>,
    pub explanation: Option<String>,
    pub correction_used: bool,
    /// Times the Ask has entered a generation state (initial + correction)
    pub generation_passes: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AskRequest {
    pub fn new(question: String, data_source_id: String, history: Vec<AskHistoryTurn>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question,
            data_source_id,
            history,
            status: AskStatus::Submitted,
            generated_sql: None,
            result: None,
            error: None,
            confidence: None,
            explanation: None,
            correction_used: false,
            generation_passes: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Registry of Asks with guarded mutation: updates are refused once an Ask
/// is terminal, so in-flight work cannot overwrite a stop or a failure.
#[derive(Default)]
pub(crate) struct AskTracker {
    asks: RwLock<HashMap<Uuid, AskRequest>>,
}

impl AskTracker {
    pub fn insert(&self, ask: AskRequest) {
        self.asks.write().unwrap().insert(ask.id, ask);
    }

    pub fn snapshot(&self, id: Uuid) -> Option<AskRequest> {
        self.asks.read().unwrap().get(&id).cloned()
    }

    pub fn is_terminal(&self, id: Uuid) -> bool {
        self.asks
            .read()
            .unwrap()
            .get(&id)
            .map(|ask| ask.status.is_terminal())
            .unwrap_or(true)
    }

    /// Move an Ask along a legal edge; returns false when the edge is not
    /// legal (including any attempt to leave a terminal state or to enter
    /// `Correcting` a second time).
    pub fn transition(&self, id: Uuid, next: AskStatus) -> bool {
        let mut asks = self.asks.write().unwrap();
        let Some(ask) = asks.get_mut(&id) else {
            return false;
        };
        if !ask.status.can_transition_to(next) {
            return false;
        }
        if next == AskStatus::Correcting {
            if ask.correction_used {
                return false;
            }
            ask.correction_used = true;
        }
        debug!(ask = %id, from = %ask.status, to = %next, "ask transition");
        ask.status = next;
        if matches!(next, AskStatus::Generating | AskStatus::Correcting) {
            ask.generation_passes += 1;
        }
        if next.is_terminal() {
            ask.finished_at = Some(Utc::now());
        }
        true
    }

    /// Apply a field update unless the Ask is already terminal
    pub fn update<F: FnOnce(&mut AskRequest)>(&self, id: Uuid, f: F) -> bool {
        let mut asks = self.asks.write().unwrap();
        match asks.get_mut(&id) {
            Some(ask) if !ask.status.is_terminal() => {
                f(ask);
                true
            }
            _ => false,
        }
    }

    pub fn complete(&self, id: Uuid, result: QueryResult) {
        self.update(id, |ask| ask.result = Some(result));
        self.transition(id, AskStatus::Completed);
    }

    pub fn fail(&self, id: Uuid, error: String) {
        self.update(id, |ask| ask.error = Some(error));
        self.transition(id, AskStatus::Failed);
    }

    pub fn stop(&self, id: Uuid) -> bool {
        let stopped = self.transition(id, AskStatus::Stopped);
        if stopped {
            info!(ask = %id, "ask stopped by caller");
        }
        stopped
    }
}

/// Everything an Ask task needs, shared by all Asks
pub(crate) struct AskContext {
    pub config: EngineConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub cache: Arc<ResultCache>,
    pub introspector: Arc<SchemaIntrospector>,
    pub generation: SqlGenerationPipeline,
    pub correction: SqlCorrectionPipeline,
    pub tracker: Arc<AskTracker>,
}

/// Drive one Ask from pickup to a terminal state.
///
/// Stage order is fixed: generate, gate, cache/execute, at most one
/// correction, terminal. After every suspension point the task re-checks for
/// cancellation and discards its work if the Ask has been stopped.
pub(crate) async fn run_ask(ctx: Arc<AskContext>, id: Uuid, descriptor: DataSourceDescriptor) {
    if !ctx.tracker.transition(id, AskStatus::Generating) {
        return;
    }
    let adapter = dialect_adapter(descriptor.dialect);

    let schema = match ctx.introspector.introspect(&ctx.registry, &descriptor).await {
        Ok(schema) => schema,
        Err(e) => {
            ctx.tracker.fail(id, e.user_message());
            return;
        }
    };
    if ctx.tracker.is_terminal(id) {
        return;
    }

    let Some(snapshot) = ctx.tracker.snapshot(id) else {
        return;
    };
    let generated = ctx
        .generation
        .generate(&snapshot.question, &descriptor.id, &schema, &snapshot.history)
        .await;
    ctx.tracker.update(id, |ask| {
        ask.generated_sql = Some(generated.sql.clone());
        ask.confidence = Some(generated.confidence);
        ask.explanation = Some(generated.explanation.clone());
    });

    // A gate rejection here is a generation failure: it does not consume the
    // correction attempt, the Ask simply fails with the rejection reason.
    let safe = match safety::validate(&generated.sql, adapter, ctx.config.row_limit) {
        Ok(safe) => safe,
        Err(e) => {
            ctx.tracker.fail(id, e.user_message());
            return;
        }
    };
    ctx.tracker
        .update(id, |ask| ask.generated_sql = Some(safe.sql.clone()));

    if !ctx.tracker.transition(id, AskStatus::Executing) {
        return;
    }

    let mut sql = safe.sql;
    loop {
        if let Some(hit) = ctx.cache.lookup(&descriptor.id, &sql) {
            debug!(ask = %id, "cache hit");
            ctx.tracker.complete(id, hit);
            return;
        }

        let pool = match ctx.registry.acquire(&descriptor).await {
            Ok(pool) => pool,
            Err(e) => {
                ctx.tracker.fail(id, e.user_message());
                return;
            }
        };
        if ctx.tracker.is_terminal(id) {
            return;
        }

        match execute(&pool, &sql, ctx.config.execution_timeout()).await {
            Ok(result) => {
                if ctx.tracker.is_terminal(id) {
                    return;
                }
                ctx.cache.store(&descriptor.id, &sql, &result);
                ctx.tracker.complete(id, result);
                return;
            }
            Err(e) if e.is_correctable() => {
                let cause = e.user_message();
                let already_corrected = ctx
                    .tracker
                    .snapshot(id)
                    .map(|ask| ask.correction_used)
                    .unwrap_or(true);
                if already_corrected {
                    ctx.tracker.fail(
                        id,
                        format!("{cause} (after one correction attempt; last SQL: {sql})"),
                    );
                    return;
                }

                if !ctx.tracker.transition(id, AskStatus::Correcting) {
                    return;
                }

                match ctx
                    .correction
                    .correct(
                        &sql,
                        &cause,
                        &descriptor.id,
                        &schema,
                        adapter,
                        ctx.config.row_limit,
                    )
                    .await
                {
                    Ok(corrected) => {
                        if ctx.tracker.is_terminal(id) {
                            return;
                        }
                        sql = corrected.sql;
                        ctx.tracker.update(id, |ask| {
                            ask.generated_sql = Some(sql.clone());
                            ask.confidence = Some(corrected.confidence);
                            ask.explanation = Some(corrected.explanation.clone());
                        });
                        if !ctx.tracker.transition(id, AskStatus::Executing) {
                            return;
                        }
                    }
                    Err(correction_err) => {
                        ctx.tracker.fail(
                            id,
                            format!(
                                "correction failed: {} (original error: {cause}; last SQL: {sql})",
                                correction_err.user_message()
                            ),
                        );
                        return;
                    }
                }
            }
            Err(e) => {
                ctx.tracker
                    .fail(id, format!("{} (last SQL: {sql})", e.user_message()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(AskStatus::Submitted, AskStatus::Generating, true)]
    #[case(AskStatus::Generating, AskStatus::Executing, true)]
    #[case(AskStatus::Executing, AskStatus::Correcting, true)]
    #[case(AskStatus::Correcting, AskStatus::Executing, true)]
    #[case(AskStatus::Executing, AskStatus::Completed, true)]
    #[case(AskStatus::Submitted, AskStatus::Stopped, true)]
    #[case(AskStatus::Correcting, AskStatus::Stopped, true)]
    #[case(AskStatus::Submitted, AskStatus::Executing, false)]
    #[case(AskStatus::Executing, AskStatus::Generating, false)]
    #[case(AskStatus::Completed, AskStatus::Stopped, false)]
    #[case(AskStatus::Failed, AskStatus::Generating, false)]
    #[case(AskStatus::Stopped, AskStatus::Completed, false)]
    fn test_state_machine_edges(
        #[case] from: AskStatus,
        #[case] to: AskStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_terminal_asks_are_immutable() {
        let tracker = AskTracker::default();
        let ask = AskRequest::new("q".to_string(), "ds1".to_string(), Vec::new());
        let id = ask.id;
        tracker.insert(ask);

        assert!(tracker.transition(id, AskStatus::Generating));
        assert!(tracker.transition(id, AskStatus::Executing));
        tracker.complete(
            id,
            QueryResult {
                columns: vec![],
                rows: vec![],
                row_count: 0,
                execution_time_ms: 1,
                cached: false,
            },
        );

        let before = tracker.snapshot(id).unwrap();
        assert_eq!(before.status, AskStatus::Completed);
        assert!(before.finished_at.is_some());

        // No mutation of any kind once terminal
        assert!(!tracker.stop(id));
        assert!(!tracker.update(id, |ask| ask.error = Some("late".to_string())));
        tracker.fail(id, "late failure".to_string());

        let after = tracker.snapshot(id).unwrap();
        assert_eq!(after.status, AskStatus::Completed);
        assert!(after.error.is_none());
    }

    #[test]
    fn test_generation_passes_counts_corrections() {
        let tracker = AskTracker::default();
        let ask = AskRequest::new("q".to_string(), "ds1".to_string(), Vec::new());
        let id = ask.id;
        tracker.insert(ask);

        tracker.transition(id, AskStatus::Generating);
        tracker.transition(id, AskStatus::Executing);
        tracker.transition(id, AskStatus::Correcting);
        tracker.transition(id, AskStatus::Executing);

        let snapshot = tracker.snapshot(id).unwrap();
        assert_eq!(snapshot.generation_passes, 2);

        // The machine offers no edge back into a generation state
        assert!(!tracker.transition(id, AskStatus::Correcting));
        assert!(!tracker.transition(id, AskStatus::Generating));
    }

    #[test]
    fn test_stop_from_non_terminal() {
        let tracker = AskTracker::default();
        let ask = AskRequest::new("q".to_string(), "ds1".to_string(), Vec::new());
        let id = ask.id;
        tracker.insert(ask);

        tracker.transition(id, AskStatus::Generating);
        assert!(tracker.stop(id));
        let snapshot = tracker.snapshot(id).unwrap();
        assert_eq!(snapshot.status, AskStatus::Stopped);
        assert!(snapshot.finished_at.is_some());
    }
}
