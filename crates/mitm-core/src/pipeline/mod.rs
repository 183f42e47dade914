//! Middleware/Interceptor pipeline (spec.md §4.6): a state machine over a
//! [`RequestContext`] with phases `beforeRequest → (optional) beforeResponse
//! → afterResponse → onError`, plus `interceptUpgrade` for the Upgrade
//! Handler.
//!
//! A stage is either a middleware (arbitrary mutation, always participates)
//! or an interceptor (gated by `should_run`, returns a [`Decision`]); both
//! shapes are expressed through the single [`PipelineStage`] trait below —
//! a middleware simply always returns `Decision::Continue`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::PipelineConfig;
use crate::context::{ModifiedRequest, RequestContext, ResponseParts};
use crate::error::PipelineError;
use crate::telemetry::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
	BeforeRequest,
	BeforeResponse,
	AfterResponse,
	OnError,
	InterceptUpgrade,
}

/// Result of a stage's `run` invocation (spec.md §3 `Interceptor Decision`).
pub enum Decision {
	Continue,
	DirectResponse(ResponseParts),
	ModifyAndForward(ModifiedRequest),
	Stop(String),
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
	fn name(&self) -> &str;

	/// Smaller runs first; ties broken by name (spec.md §4.6).
	fn priority(&self) -> i32 {
		0
	}

	/// A critical stage's error transitions the pipeline to `onError`
	/// instead of being logged and skipped (spec.md §4.6).
	fn critical(&self) -> bool {
		false
	}

	/// Interceptors override this to gate `run` per spec.md's
	/// `shouldIntercept`; middleware stages use the default (always runs).
	async fn should_run(&self, ctx: &RequestContext, phase: Phase) -> bool {
		let _ = (ctx, phase);
		true
	}

	/// Declares whether this stage needs the response body buffered into
	/// `context.response` before `beforeResponse` runs, per spec.md §4.7
	/// step 7 ("if no interceptor subscribed to response modification,
	/// stream bytes directly"). Most middleware only touch headers.
	fn wants_response_body(&self) -> bool {
		false
	}

	async fn run(&self, ctx: &mut RequestContext, phase: Phase) -> Result<Decision, PipelineError>;
}

/// A non-`critical` stage timed out or errored but execution continues;
/// a `critical` one's error propagated out of `onError` unrecovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
	Completed,
	UnrecoveredError,
}

pub struct PipelinePermit(#[allow(dead_code)] OwnedSemaphorePermit);

pub struct PipelineManager {
	stages: Vec<Arc<dyn PipelineStage>>,
	stage_timeout: Duration,
	semaphore: Arc<Semaphore>,
	metrics: Arc<Metrics>,
}

impl PipelineManager {
	pub fn new(mut stages: Vec<Arc<dyn PipelineStage>>, config: &PipelineConfig, metrics: Arc<Metrics>) -> Self {
		stages.sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.name().cmp(b.name())));
		Self {
			stages,
			stage_timeout: config.stage_timeout,
			semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
			metrics,
		}
	}

	/// Admission control (spec.md §4.6 "caps concurrent in-flight
	/// pipelines ... rejects with `Overloaded` beyond that"). Hold the
	/// returned permit for the lifetime of the request's pipeline work.
	pub fn try_enter(&self) -> Result<PipelinePermit, PipelineError> {
		self.semaphore.clone().try_acquire_owned().map(PipelinePermit).map_err(|_| PipelineError::Overloaded)
	}

	pub fn any_wants_response_body(&self) -> bool {
		self.stages.iter().any(|s| s.wants_response_body())
	}

	/// Runs every registered stage in priority order for `phase`, honoring
	/// `ctx.stopped` short-circuiting and the critical/non-critical error
	/// discipline. Stops early (and does not re-enter remaining stages) if
	/// an `onError` recovery attempt still leaves `ctx.error` set.
	pub async fn run_phase(&self, ctx: &mut RequestContext, phase: Phase) -> PhaseOutcome {
		let mut idx = 0;
		while idx < self.stages.len() {
			if ctx.stopped {
				break;
			}
			let stage = self.stages[idx].clone();
			if stage.should_run(ctx, phase).await {
				let started = Instant::now();
				let result = match timeout(self.stage_timeout, stage.run(ctx, phase)).await {
					Ok(outcome) => outcome,
					Err(_) => Err(PipelineError::StageTimeout(stage.name().to_string())),
				};
				self.metrics.pipeline.stage_executions.inc();
				self.metrics.pipeline.stage_duration_micros_total.inc_by(started.elapsed().as_micros() as u64);
				match result {
					Ok(decision) => self.apply_decision(ctx, decision),
					Err(err) => {
						self.metrics.pipeline.stage_errors.inc();
						if stage.critical() {
							ctx.error = Some(err.into());
							if self.run_error_phase(ctx).await == PhaseOutcome::UnrecoveredError {
								return PhaseOutcome::UnrecoveredError;
							}
							// recovered: fall through and resume at idx + 1
						} else {
							tracing::warn!(stage = stage.name(), error = %err, phase = ?phase, "non-critical pipeline stage failed");
						}
					},
				}
			}
			idx += 1;
		}
		PhaseOutcome::Completed
	}

	/// Runs `onError` stages; a stage clears `ctx.error` to effect
	/// recovery (spec.md §4.6).
	async fn run_error_phase(&self, ctx: &mut RequestContext) -> PhaseOutcome {
		for stage in &self.stages {
			if ctx.error.is_none() {
				break;
			}
			if !stage.should_run(ctx, Phase::OnError).await {
				continue;
			}
			let started = Instant::now();
			let outcome = timeout(self.stage_timeout, stage.run(ctx, Phase::OnError)).await;
			self.metrics.pipeline.stage_executions.inc();
			self.metrics.pipeline.stage_duration_micros_total.inc_by(started.elapsed().as_micros() as u64);
			match outcome {
				Ok(Ok(decision)) => self.apply_decision(ctx, decision),
				Ok(Err(err)) => {
					self.metrics.pipeline.stage_errors.inc();
					tracing::warn!(stage = stage.name(), error = %err, "onError stage itself failed");
				},
				Err(_) => {
					self.metrics.pipeline.stage_errors.inc();
					tracing::warn!(stage = stage.name(), "onError stage timed out");
				},
			}
		}
		if ctx.error.is_some() { PhaseOutcome::UnrecoveredError } else { PhaseOutcome::Completed }
	}

	fn apply_decision(&self, ctx: &mut RequestContext, decision: Decision) {
		match decision {
			Decision::Continue => {},
			Decision::DirectResponse(resp) => {
				ctx.response = Some(resp.clone());
				ctx.direct_response = Some(resp);
				ctx.intercepted = true;
				ctx.stopped = true;
			},
			Decision::ModifyAndForward(delta) => ctx.apply_modification(delta),
			Decision::Stop(reason) => {
				ctx.stopped = true;
				ctx.meta_bag.insert("stop_reason", reason);
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::StatusCode;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingMiddleware {
		priority: i32,
		name: &'static str,
		calls: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl PipelineStage for CountingMiddleware {
		fn name(&self) -> &str {
			self.name
		}
		fn priority(&self) -> i32 {
			self.priority
		}
		async fn run(&self, _ctx: &mut RequestContext, _phase: Phase) -> Result<Decision, PipelineError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(Decision::Continue)
		}
	}

	struct DirectResponseInterceptor;

	#[async_trait]
	impl PipelineStage for DirectResponseInterceptor {
		fn name(&self) -> &str {
			"direct"
		}
		fn priority(&self) -> i32 {
			10
		}
		async fn run(&self, _ctx: &mut RequestContext, _phase: Phase) -> Result<Decision, PipelineError> {
			Ok(Decision::DirectResponse(ResponseParts { status: StatusCode::FORBIDDEN, headers: Default::default(), body: Default::default() }))
		}
	}

	struct CriticalFailThenRecover {
		recovered: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl PipelineStage for CriticalFailThenRecover {
		fn name(&self) -> &str {
			"aaa-critical"
		}
		fn priority(&self) -> i32 {
			0
		}
		fn critical(&self) -> bool {
			true
		}
		async fn run(&self, ctx: &mut RequestContext, phase: Phase) -> Result<Decision, PipelineError> {
			if phase == Phase::OnError {
				ctx.error = None;
				self.recovered.fetch_add(1, Ordering::SeqCst);
				return Ok(Decision::Continue);
			}
			Err(PipelineError::InterceptorError("aaa-critical".to_string(), "boom".to_string()))
		}
	}

	fn config() -> PipelineConfig {
		PipelineConfig { stage_timeout: Duration::from_millis(200), max_concurrent: 4 }
	}

	#[tokio::test]
	async fn stages_run_in_priority_then_name_order() {
		let calls = Arc::new(AtomicUsize::new(0));
		let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

		struct OrderRecorder {
			name: &'static str,
			priority: i32,
			order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
		}
		#[async_trait]
		impl PipelineStage for OrderRecorder {
			fn name(&self) -> &str {
				self.name
			}
			fn priority(&self) -> i32 {
				self.priority
			}
			async fn run(&self, _ctx: &mut RequestContext, _phase: Phase) -> Result<Decision, PipelineError> {
				self.order.lock().push(self.name);
				Ok(Decision::Continue)
			}
		}

		let stages: Vec<Arc<dyn PipelineStage>> = vec![
			Arc::new(OrderRecorder { name: "z-first", priority: 0, order: order.clone() }),
			Arc::new(OrderRecorder { name: "a-first", priority: 0, order: order.clone() }),
			Arc::new(OrderRecorder { name: "only", priority: -5, order: order.clone() }),
			Arc::new(CountingMiddleware { priority: 5, name: "late", calls: calls.clone() }),
		];
		let manager = PipelineManager::new(stages, &config(), Arc::new(Metrics::new()));
		let mut ctx = RequestContext::test_blank();
		manager.run_phase(&mut ctx, Phase::BeforeRequest).await;
		assert_eq!(*order.lock(), vec!["only", "a-first", "z-first"]);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn direct_response_stops_remaining_stages() {
		let calls = Arc::new(AtomicUsize::new(0));
		let stages: Vec<Arc<dyn PipelineStage>> =
			vec![Arc::new(DirectResponseInterceptor), Arc::new(CountingMiddleware { priority: 99, name: "never", calls: calls.clone() })];
		let manager = PipelineManager::new(stages, &config(), Arc::new(Metrics::new()));
		let mut ctx = RequestContext::test_blank();
		manager.run_phase(&mut ctx, Phase::BeforeRequest).await;
		assert!(ctx.stopped);
		assert!(ctx.intercepted);
		assert_eq!(ctx.response.unwrap().status, StatusCode::FORBIDDEN);
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn critical_stage_error_recovers_via_on_error_and_resumes() {
		let recovered = Arc::new(AtomicUsize::new(0));
		let after = Arc::new(AtomicUsize::new(0));
		let stages: Vec<Arc<dyn PipelineStage>> = vec![
			Arc::new(CriticalFailThenRecover { recovered: recovered.clone() }),
			Arc::new(CountingMiddleware { priority: 1, name: "after", calls: after.clone() }),
		];
		let manager = PipelineManager::new(stages, &config(), Arc::new(Metrics::new()));
		let mut ctx = RequestContext::test_blank();
		let outcome = manager.run_phase(&mut ctx, Phase::BeforeRequest).await;
		assert_eq!(outcome, PhaseOutcome::Completed);
		assert_eq!(recovered.load(Ordering::SeqCst), 1);
		assert_eq!(after.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn overloaded_pipeline_rejects_beyond_capacity() {
		let manager = PipelineManager::new(vec![], &PipelineConfig { stage_timeout: Duration::from_secs(1), max_concurrent: 1 }, Arc::new(Metrics::new()));
		let _first = manager.try_enter().unwrap();
		assert!(matches!(manager.try_enter(), Err(PipelineError::Overloaded)));
	}
}
