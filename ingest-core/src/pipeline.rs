//! One ingestion run: ensure schema, fetch, normalize, persist.
//!
//! The coordinator walks a small state machine and checks the cancellation signal
//! before every transition. Transient failures are retried with exponential backoff;
//! everything else ends the run on the spot.

use backon::Retryable;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Instrument, info, info_span, warn};

use crate::{
    config::{RetryPolicy, RunConfig},
    error::{ErrorKind, IngestError, Step, StepError},
    model::{RawPayload, WeatherSnapshot},
    normalize::normalize,
    provider::{WeatherSource, WeatherstackClient},
    store::{PgStore, SnapshotStore},
};

/// Read side of the orchestrator's cancel switch.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    pub fn never() -> Self {
        Self::default()
    }

    /// A sender/receiver pair; sending `true` cancels the run at the next boundary.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

#[derive(Debug)]
pub enum RunState {
    Idle,
    SchemaReady,
    Fetched(RawPayload),
    Normalized(WeatherSnapshot),
    Persisted(WeatherSnapshot),
    Aborted(StepError),
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::SchemaReady => "schema_ready",
            RunState::Fetched(_) => "fetched",
            RunState::Normalized(_) => "normalized",
            RunState::Persisted(_) => "persisted",
            RunState::Aborted(_) => "aborted",
        }
    }

    /// The step that leaves this state, if it is not terminal.
    fn next_step(&self) -> Option<Step> {
        match self {
            RunState::Idle => Some(Step::Schema),
            RunState::SchemaReady => Some(Step::Fetch),
            RunState::Fetched(_) => Some(Step::Normalize),
            RunState::Normalized(_) => Some(Step::Persist),
            RunState::Persisted(_) | RunState::Aborted(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub fetch_attempts: usize,
    pub persist_attempts: usize,
    pub snapshot: WeatherSnapshot,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub step: Step,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// The single structured result handed back to the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success(RunReport),
    Failure(RunFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    fn failure(err: StepError, run_id: Option<String>) -> Self {
        RunOutcome::Failure(RunFailure {
            kind: err.kind(),
            step: err.step,
            message: err.source.to_string(),
            run_id,
            finished_at: Utc::now(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Attempts {
    fetch: usize,
    persist: usize,
}

/// Drives exactly one run for one location. Consumed by [`RunCoordinator::run`].
#[derive(Debug)]
pub struct RunCoordinator {
    location: String,
    run_id: Option<String>,
    retry: RetryPolicy,
    source: Arc<dyn WeatherSource>,
    store: Arc<dyn SnapshotStore>,
    cancel: Cancellation,
}

impl RunCoordinator {
    pub fn new(
        location: impl Into<String>,
        retry: RetryPolicy,
        source: Arc<dyn WeatherSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            location: location.into(),
            run_id: None,
            retry,
            source,
            store,
            cancel: Cancellation::never(),
        }
    }

    /// Wire up the weatherstack client and the PostgreSQL store from a resolved config.
    pub fn from_config(config: &RunConfig) -> Result<Self, StepError> {
        let source = WeatherstackClient::from_config(config).map_err(|e| e.at(Step::Config))?;
        let store = PgStore::from_config(config).map_err(|e| e.at(Step::Config))?;
        Ok(Self::new(
            config.location.clone(),
            config.retry,
            Arc::new(source),
            Arc::new(store),
        ))
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(self) -> RunOutcome {
        let span = info_span!(
            "run",
            location = %self.location,
            run_id = self.run_id.as_deref().unwrap_or("-"),
        );

        async move {
            let mut attempts = Attempts::default();
            let mut state = RunState::Idle;

            let outcome = loop {
                state = match state {
                    RunState::Persisted(snapshot) => {
                        info!(
                            fetch_attempts = attempts.fetch,
                            persist_attempts = attempts.persist,
                            "snapshot persisted"
                        );
                        break RunOutcome::Success(RunReport {
                            location: self.location.clone(),
                            run_id: self.run_id.clone(),
                            fetch_attempts: attempts.fetch,
                            persist_attempts: attempts.persist,
                            snapshot,
                            finished_at: Utc::now(),
                        });
                    }
                    RunState::Aborted(err) => {
                        warn!(
                            step = %err.step,
                            kind = %err.kind(),
                            error = %err.source,
                            "run aborted"
                        );
                        break RunOutcome::failure(err, self.run_id.clone());
                    }
                    other => self.advance(other, &mut attempts).await,
                };
            };

            self.store.close().await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn advance(&self, state: RunState, attempts: &mut Attempts) -> RunState {
        let Some(step) = state.next_step() else {
            return state;
        };

        if self.cancel.is_cancelled() {
            return RunState::Aborted(IngestError::Cancelled(step).at(step));
        }

        info!(from = state.name(), %step, "advancing");

        let next = match state {
            RunState::Idle => self.store.ensure_schema().await.map(|()| RunState::SchemaReady),
            RunState::SchemaReady => self.fetch(&mut attempts.fetch).await.map(RunState::Fetched),
            RunState::Fetched(payload) => normalize(&payload).map(RunState::Normalized),
            RunState::Normalized(snapshot) => self
                .persist(&snapshot, &mut attempts.persist)
                .await
                .map(|()| RunState::Persisted(snapshot)),
            terminal @ (RunState::Persisted(_) | RunState::Aborted(_)) => Ok(terminal),
        };

        next.unwrap_or_else(|err| RunState::Aborted(err.at(step)))
    }

    async fn fetch(&self, attempts: &mut usize) -> Result<RawPayload, IngestError> {
        let result = (|| {
            *attempts += 1;
            self.source.fetch(&self.location)
        })
        .retry(self.retry.backoff())
        .when(|e: &IngestError| e.is_retryable() && !self.cancel.is_cancelled())
        .notify(|e: &IngestError, delay| {
            warn!(error = %e, ?delay, "fetch failed, retrying");
        })
        .await;

        self.cancelled_during_retry(result, Step::Fetch)
    }

    async fn persist(
        &self,
        snapshot: &WeatherSnapshot,
        attempts: &mut usize,
    ) -> Result<(), IngestError> {
        let result = (|| {
            *attempts += 1;
            self.store.persist(snapshot)
        })
        .retry(self.retry.backoff())
        .when(|e: &IngestError| e.is_retryable() && !self.cancel.is_cancelled())
        .notify(|e: &IngestError, delay| {
            warn!(error = %e, ?delay, "persist failed, retrying");
        })
        .await;

        self.cancelled_during_retry(result, Step::Persist)
    }

    /// A retryable error that stopped retrying because of cancellation reports as cancelled.
    fn cancelled_during_retry<T>(
        &self,
        result: Result<T, IngestError>,
        step: Step,
    ) -> Result<T, IngestError> {
        match result {
            Err(e) if e.is_retryable() && self.cancel.is_cancelled() => {
                warn!(error = %e, "giving up retries after cancellation");
                Err(IngestError::Cancelled(step))
            }
            other => other,
        }
    }
}

/// Build the production coordinator and run it. Wiring failures are reported as a
/// `config` step failure rather than an error, so callers always get an outcome.
pub async fn run_once(
    config: &RunConfig,
    run_id: Option<String>,
    cancel: Cancellation,
) -> RunOutcome {
    match RunCoordinator::from_config(config) {
        Ok(coordinator) => {
            let coordinator = coordinator.with_cancellation(cancel);
            match run_id {
                Some(id) => coordinator.with_run_id(id).run().await,
                None => coordinator.run().await,
            }
        }
        Err(err) => RunOutcome::failure(err, run_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::{collections::VecDeque, sync::Mutex, time::Duration};
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method};

    /// Replays queued responses; the last one repeats once the queue runs dry.
    #[derive(Debug)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<RawPayload, IngestError>>>,
        calls: Mutex<usize>,
        cancel_on_fetch: Option<watch::Sender<bool>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<RawPayload, IngestError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
                cancel_on_fetch: None,
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    fn replay(err: &IngestError) -> IngestError {
        match err {
            IngestError::Transport(m) => IngestError::Transport(m.clone()),
            other => IngestError::Parse(format!("unexpected repeat of {other}")),
        }
    }

    #[async_trait]
    impl WeatherSource for ScriptedSource {
        async fn fetch(&self, _location: &str) -> Result<RawPayload, IngestError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(tx) = &self.cancel_on_fetch {
                let _ = tx.send(true);
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                return script.pop_front().unwrap();
            }
            match script.front().unwrap() {
                Ok(payload) => Ok(payload.clone()),
                Err(e) => Err(replay(e)),
            }
        }
    }

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }
    }

    fn leipzig() -> RawPayload {
        RawPayload(json!({
            "current": { "temperature": 21.4, "weather_descriptions": ["Sunny"] },
            "location": { "name": "Leipzig", "country": "Germany" }
        }))
    }

    fn coordinator(
        source: &Arc<ScriptedSource>,
        store: &Arc<MemoryStore>,
        retries: usize,
    ) -> RunCoordinator {
        RunCoordinator::new("Leipzig", fast_retry(retries), source.clone(), store.clone())
    }

    fn expect_failure(outcome: RunOutcome) -> RunFailure {
        match outcome {
            RunOutcome::Failure(f) => f,
            RunOutcome::Success(r) => panic!("expected failure, got success: {r:?}"),
        }
    }

    fn invalid_key() -> IngestError {
        IngestError::Upstream {
            code: 101,
            kind: "invalid_access_key".into(),
            info: "invalid key".into(),
        }
    }

    #[tokio::test]
    async fn successful_run_persists_one_row() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(leipzig())]));
        let store = Arc::new(MemoryStore::new());

        let outcome = coordinator(&source, &store, 3).with_run_id("manual-1").run().await;

        let RunOutcome::Success(report) = outcome else {
            panic!("expected success");
        };
        assert_eq!(report.fetch_attempts, 1);
        assert_eq!(report.persist_attempts, 1);
        assert_eq!(report.run_id.as_deref(), Some("manual-1"));

        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, Some(21.4));
        assert_eq!(rows[0].weather_description.as_deref(), Some("Sunny"));
        assert_eq!(rows[0].city.as_deref(), Some("Leipzig"));
        assert_eq!(rows[0].country.as_deref(), Some("Germany"));
        assert!(rows[0].air_quality_is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_retried_exactly_the_configured_times() {
        let source = Arc::new(ScriptedSource::new(vec![Err(IngestError::Transport(
            "connection refused".into(),
        ))]));
        let store = Arc::new(MemoryStore::new());

        let failure = expect_failure(coordinator(&source, &store, 3).run().await);

        assert_eq!(failure.kind, ErrorKind::Transport);
        assert_eq!(failure.step, Step::Fetch);
        assert_eq!(source.calls(), 4, "one attempt plus three retries");
        assert!(store.rows().is_empty());
        assert_eq!(store.persist_calls(), 0);
    }

    #[tokio::test]
    async fn transport_blip_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(IngestError::Transport("timed out".into())),
            Ok(leipzig()),
        ]));
        let store = Arc::new(MemoryStore::new());

        let outcome = coordinator(&source, &store, 3).run().await;

        let RunOutcome::Success(report) = outcome else {
            panic!("expected success");
        };
        assert_eq!(report.fetch_attempts, 2);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn non_transport_fetch_errors_are_not_retried() {
        let cases = [
            (
                IngestError::HttpStatus {
                    status: 401,
                    body: "unauthorized".into(),
                },
                ErrorKind::HttpStatus,
            ),
            (invalid_key(), ErrorKind::Upstream),
            (IngestError::Config("location must not be empty".into()), ErrorKind::Config),
        ];

        for (err, kind) in cases {
            let source = Arc::new(ScriptedSource::new(vec![Err(err), Ok(leipzig())]));
            let store = Arc::new(MemoryStore::new());

            let failure = expect_failure(coordinator(&source, &store, 3).run().await);

            assert_eq!(failure.kind, kind);
            assert_eq!(failure.step, Step::Fetch);
            assert_eq!(source.calls(), 1);
            assert!(store.rows().is_empty());
        }
    }

    #[tokio::test]
    async fn schema_failure_stops_before_fetch() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(leipzig())]));
        let store = Arc::new(MemoryStore::failing_schema("permission denied for schema public"));

        let failure = expect_failure(coordinator(&source, &store, 3).run().await);

        assert_eq!(failure.kind, ErrorKind::Schema);
        assert_eq!(failure.step, Step::Schema);
        assert!(failure.message.contains("permission denied"));
        assert_eq!(source.calls(), 0);
        assert_eq!(store.persist_calls(), 0);
    }

    #[tokio::test]
    async fn non_object_payload_aborts_at_normalize() {
        let payload = RawPayload(json!(["not", "an", "object"]));
        let source = Arc::new(ScriptedSource::new(vec![Ok(payload)]));
        let store = Arc::new(MemoryStore::new());

        let failure = expect_failure(coordinator(&source, &store, 3).run().await);

        assert_eq!(failure.kind, ErrorKind::Parse);
        assert_eq!(failure.step, Step::Normalize);
        assert_eq!(source.calls(), 1);
        assert_eq!(store.persist_calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_database_retries_then_fails_with_no_rows() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(leipzig())]));
        let store = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            store.push_failure(IngestError::transient_write("connection refused"));
        }

        let failure = expect_failure(coordinator(&source, &store, 2).run().await);

        assert_eq!(failure.kind, ErrorKind::Write);
        assert_eq!(failure.step, Step::Persist);
        assert_eq!(store.persist_calls(), 3);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn transient_write_recovers_on_retry() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(leipzig())]));
        let store = Arc::new(MemoryStore::new());
        store.push_failure(IngestError::transient_write(
            "server closed the connection unexpectedly",
        ));

        let outcome = coordinator(&source, &store, 2).run().await;

        let RunOutcome::Success(report) = outcome else {
            panic!("expected success");
        };
        assert_eq!(report.persist_attempts, 2);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn fatal_write_is_not_retried() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(leipzig())]));
        let store = Arc::new(MemoryStore::new());
        store.push_failure(IngestError::fatal_write("value too long for type"));

        let failure = expect_failure(coordinator(&source, &store, 3).run().await);

        assert_eq!(failure.kind, ErrorKind::Write);
        assert_eq!(store.persist_calls(), 1);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(leipzig())]));
        let store = Arc::new(MemoryStore::new());
        let (tx, cancel) = Cancellation::channel();
        tx.send(true).unwrap();

        let failure =
            expect_failure(coordinator(&source, &store, 3).with_cancellation(cancel).run().await);

        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(failure.step, Step::Schema);
        assert_eq!(store.ensure_calls(), 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_honoured_at_the_next_boundary() {
        let (tx, cancel) = Cancellation::channel();
        let source = Arc::new(ScriptedSource {
            cancel_on_fetch: Some(tx),
            ..ScriptedSource::new(vec![Ok(leipzig())])
        });
        let store = Arc::new(MemoryStore::new());

        let failure =
            expect_failure(coordinator(&source, &store, 3).with_cancellation(cancel).run().await);

        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(failure.step, Step::Normalize);
        assert_eq!(source.calls(), 1);
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let (tx, cancel) = Cancellation::channel();
        let source = Arc::new(ScriptedSource {
            cancel_on_fetch: Some(tx),
            ..ScriptedSource::new(vec![Err(IngestError::Transport("reset".into()))])
        });
        let store = Arc::new(MemoryStore::new());

        let failure =
            expect_failure(coordinator(&source, &store, 5).with_cancellation(cancel).run().await);

        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(failure.step, Step::Fetch);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn upstream_error_over_http_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "error": { "code": 101, "info": "invalid key" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = WeatherstackClient::new("BAD", server.uri(), Duration::from_secs(2)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let outcome = RunCoordinator::new("Leipzig", fast_retry(3), Arc::new(client), store.clone())
            .run()
            .await;

        let failure = expect_failure(outcome);
        assert_eq!(failure.kind, ErrorKind::Upstream);
        assert!(failure.message.contains("invalid key"));
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn run_once_reports_wiring_errors_as_config_failures() {
        let config = RunConfig {
            api_key: "KEY".into(),
            location: "Leipzig".into(),
            database_url: "definitely not a url".into(),
            endpoint: "http://127.0.0.1:9".into(),
            http_timeout: Duration::from_secs(1),
            db_timeout: Duration::from_secs(1),
            retry: fast_retry(0),
        };

        let outcome = run_once(&config, Some("r1".into()), Cancellation::never()).await;
        let failure = expect_failure(outcome);
        assert_eq!(failure.kind, ErrorKind::Config);
        assert_eq!(failure.step, Step::Config);
        assert_eq!(failure.run_id.as_deref(), Some("r1"));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = RunOutcome::failure(invalid_key().at(Step::Fetch), None);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["kind"], "upstream_error");
        assert_eq!(value["step"], "fetch");
        assert!(value.get("run_id").is_none());
    }
}
