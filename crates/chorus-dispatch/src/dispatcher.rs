//! Fan-out / fan-in over a set of provider adapters.
//!
//! Every adapter gets its own task. A task's failure (error, timeout or
//! panic) becomes an [`InvocationOutcome`] carrying an [`OutcomeError`]; it
//! never cancels a sibling and never reaches the caller as an `Err`. Each
//! outcome is appended to the sink as soon as its task finishes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_llm::{extract_for, ChorusConfig, DynProvider};
use chorus_types::{
    ChorusError, ErrorClass, InvocationOutcome, OutcomeError, ParamMap, Prompt, Result,
    ResultRecord,
};
use chrono::{FixedOffset, Offset, Utc};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{DispatchEvent, EventEmitter, InvocationState};
use crate::prompt::PromptSource;
use crate::sink::ResultSink;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// A record the sink refused. The batch carries on; the caller decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub provider: String,
    pub message: String,
}

/// Everything one `run_all` produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// One per adapter, in completion order.
    pub outcomes: Vec<InvocationOutcome>,
    pub elapsed: Duration,
    pub sink_failures: Vec<SinkFailure>,
}

impl BatchReport {
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }

    pub fn outcome(&self, provider: &str) -> Option<&InvocationOutcome> {
        self.outcomes.iter().find(|o| o.provider == provider)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    sink: Arc<dyn ResultSink>,
    call_timeout: Duration,
    concurrency: Option<usize>,
    overlays: HashMap<String, ParamMap>,
    offset: FixedOffset,
    events: EventEmitter,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn ResultSink>) -> Self {
        Self {
            sink,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            concurrency: None,
            overlays: HashMap::new(),
            offset: Utc.fix(),
            events: EventEmitter::default(),
        }
    }

    /// Timeout and record time zone taken from `config`.
    pub fn from_config(sink: Arc<dyn ResultSink>, config: &ChorusConfig) -> Self {
        Self::new(sink)
            .with_call_timeout(config.call_timeout)
            .with_offset(config.record_offset)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Cap on simultaneous provider calls. Defaults to one slot per adapter.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    /// Parameter overlay merged onto `provider_id`'s defaults for every call.
    pub fn with_overlay(mut self, provider_id: impl Into<String>, overlay: ParamMap) -> Self {
        self.overlays.insert(provider_id.into(), overlay);
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Generate one prompt from `source`, then run it through every adapter.
    pub async fn run_prompt_source(
        &self,
        source: &dyn PromptSource,
        adapters: &[DynProvider],
    ) -> Result<BatchReport> {
        let prompt = source.generate()?;
        Ok(self.run_all(&prompt, adapters).await)
    }

    /// Invoke every adapter with `prompt` and wait for all of them.
    ///
    /// Returns exactly one outcome per adapter and appends exactly one record
    /// per outcome, whatever the individual calls did.
    pub async fn run_all(&self, prompt: &Prompt, adapters: &[DynProvider]) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        let provider_ids: Vec<String> = adapters.iter().map(|a| a.id().to_string()).collect();

        info!(%batch_id, providers = ?provider_ids, "Batch started");
        self.events.emit(DispatchEvent::BatchStarted {
            batch_id,
            providers: provider_ids,
        });

        let slots = self.concurrency.unwrap_or(adapters.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(slots));
        let prompt = Arc::new(prompt.clone());

        let mut tasks = JoinSet::new();
        for adapter in adapters {
            let task = ProviderTask {
                provider: adapter.clone(),
                prompt: prompt.clone(),
                overlay: self.overlays.get(adapter.id()).cloned().unwrap_or_default(),
                call_timeout: self.call_timeout,
                batch_id,
                events: self.events.clone(),
            };
            let sink = self.sink.clone();
            let semaphore = semaphore.clone();
            let offset = self.offset;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = task.run_supervised().await;
                let sink_failure = AssertUnwindSafe(task.persist(sink.as_ref(), &outcome, offset))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(%batch_id, provider = %outcome.provider, "Result sink panicked");
                        Some(SinkFailure {
                            provider: outcome.provider.clone(),
                            message: "result sink panicked".to_string(),
                        })
                    });
                (outcome, sink_failure)
            });
        }

        let mut outcomes = Vec::with_capacity(adapters.len());
        let mut sink_failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((outcome, sink_failure)) => {
                    outcomes.push(outcome);
                    sink_failures.extend(sink_failure);
                }
                // Only reachable if the runtime is shutting down.
                Err(e) => error!(%batch_id, error = %e, "Provider task aborted"),
            }
        }

        let report = BatchReport {
            batch_id,
            outcomes,
            elapsed: started.elapsed(),
            sink_failures,
        };
        info!(
            %batch_id,
            outcomes = report.outcomes.len(),
            failures = report.failures(),
            sink_failures = report.sink_failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch completed"
        );
        self.events.emit(DispatchEvent::BatchCompleted {
            batch_id,
            outcomes: report.outcomes.len(),
            failures: report.failures(),
            duration_ms: report.elapsed.as_millis() as u64,
        });
        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("call_timeout", &self.call_timeout)
            .field("concurrency", &self.concurrency)
            .field("overlays", &self.overlays.keys().collect::<Vec<_>>())
            .field("offset", &self.offset)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ProviderTask
// ---------------------------------------------------------------------------

struct ProviderTask {
    provider: DynProvider,
    prompt: Arc<Prompt>,
    overlay: ParamMap,
    call_timeout: Duration,
    batch_id: Uuid,
    events: EventEmitter,
}

impl ProviderTask {
    fn transition(&self, state: InvocationState) {
        debug!(batch_id = %self.batch_id, provider = self.provider.id(), ?state, "State changed");
        self.events.emit(DispatchEvent::StateChanged {
            batch_id: self.batch_id,
            provider: self.provider.id().to_string(),
            state,
        });
    }

    fn errored(&self, request_body: String, elapsed: Duration, error: OutcomeError) -> InvocationOutcome {
        warn!(
            batch_id = %self.batch_id,
            provider = self.provider.id(),
            error = %error,
            "Provider invocation failed"
        );
        self.transition(InvocationState::Errored);
        InvocationOutcome::failed(self.provider.id(), request_body, elapsed, error)
    }

    /// `invoke`, with a panic anywhere inside turned into an Internal outcome.
    async fn run_supervised(&self) -> InvocationOutcome {
        match AssertUnwindSafe(self.invoke()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.errored(
                    String::new(),
                    Duration::ZERO,
                    OutcomeError::new(ErrorClass::Internal, format!("task panicked: {message}")),
                )
            }
        }
    }

    async fn invoke(&self) -> InvocationOutcome {
        self.transition(InvocationState::Pending);

        let body = match self.provider.build_request(self.prompt.text(), &self.overlay) {
            Ok(body) => body,
            Err(e) => return self.errored(String::new(), Duration::ZERO, OutcomeError::from(&e)),
        };
        let request_body = body.to_string();
        self.transition(InvocationState::RequestBuilt);

        let started = Instant::now();
        let response = match tokio::time::timeout(self.call_timeout, self.provider.send(&body)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return self.errored(request_body, started.elapsed(), OutcomeError::from(&e))
            }
            Err(_) => {
                let e = ChorusError::RequestTimeout {
                    provider: self.provider.id().to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                };
                return self.errored(request_body, started.elapsed(), OutcomeError::from(&e));
            }
        };
        let elapsed = started.elapsed();
        self.transition(InvocationState::Called);

        let extracted = extract_for(self.provider.response_path(), &response.body);

        let error = if !response.is_success() {
            let details = response.body["details"].as_str().unwrap_or_default();
            Some(OutcomeError::new(
                ErrorClass::Provider,
                format!("HTTP {}: {details}", response.status),
            ))
        } else {
            self.provider
                .application_error(&response.body)
                .map(|message| OutcomeError::new(ErrorClass::Provider, message))
        };

        match &error {
            Some(error) => {
                warn!(
                    batch_id = %self.batch_id,
                    provider = self.provider.id(),
                    status = response.status,
                    error = %error,
                    "Provider reported failure"
                );
                self.transition(InvocationState::Errored);
            }
            None => self.transition(InvocationState::Extracted),
        }

        InvocationOutcome {
            provider: self.provider.id().to_string(),
            extracted,
            raw_response: response.body,
            request_body,
            elapsed,
            error,
        }
    }

    /// Append the outcome's record. A refusal is logged and reported back.
    async fn persist(
        &self,
        sink: &dyn ResultSink,
        outcome: &InvocationOutcome,
        offset: FixedOffset,
    ) -> Option<SinkFailure> {
        let record = ResultRecord::from_outcome(
            outcome,
            &self.prompt,
            self.batch_id,
            Utc::now().with_timezone(&offset),
        );

        match sink.append(record).await {
            Ok(()) => {
                info!(
                    batch_id = %self.batch_id,
                    provider = %outcome.provider,
                    run_time_ms = outcome.elapsed.as_millis() as u64,
                    success = outcome.is_success(),
                    "Outcome persisted"
                );
                if outcome.error.is_none() {
                    self.transition(InvocationState::Persisted);
                }
                None
            }
            Err(e) => {
                error!(
                    batch_id = %self.batch_id,
                    provider = %outcome.provider,
                    error = %e,
                    "Failed to persist outcome"
                );
                self.events.emit(DispatchEvent::SinkFailed {
                    batch_id: self.batch_id,
                    provider: outcome.provider.clone(),
                    error: e.to_string(),
                });
                Some(SinkFailure {
                    provider: outcome.provider.clone(),
                    message: e.to_string(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
