//! Counters named in spec.md §6, wired as `prometheus-client` fields on one
//! struct constructed once and handed to every component by reference —
//! mirrors the teacher's `telemetry::metrics::Metrics`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ResultLabel {
	pub result: &'static str,
}

#[derive(Debug, Default)]
pub struct RequestMetrics {
	pub total: Counter,
	pub success: Counter,
	pub error: Counter,
	pub intercepted: Counter,
}

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
	pub total: Counter,
	pub active: Gauge,
	pub ssl: Counter,
	pub websocket: Counter,
	pub reuse: Counter,
	pub new: Counter,
	pub timeout: Counter,
	pub error: Counter,
}

#[derive(Debug, Default)]
pub struct TrafficMetrics {
	pub bytes_in: Counter,
	pub bytes_out: Counter,
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
	pub stage_executions: Counter,
	pub stage_errors: Counter,
	/// Cumulative stage duration in microseconds; divide by
	/// `stage_executions` for the running average named in spec.md §6.
	pub stage_duration_micros_total: Counter,
}

#[derive(Debug, Default)]
pub struct CertFactoryMetrics {
	pub synthesized: Counter,
	pub cache_hits: Counter,
	pub evictions: Counter,
}

#[derive(Debug, Default)]
pub struct AgentPoolMetrics {
	pub new_connections: Counter,
	pub reuse_connections: Counter,
	pub timeouts: Counter,
	pub errors: Family<ResultLabel, Counter>,
}

impl AgentPoolMetrics {
	/// `reuse_connections / (new_connections + reuse_connections)`, `0.0`
	/// when nothing has been dialed yet.
	pub fn reuse_rate(&self) -> f64 {
		let reuse = self.reuse_connections.get() as f64;
		let new = self.new_connections.get() as f64;
		if reuse + new == 0.0 { 0.0 } else { reuse / (reuse + new) }
	}
}

/// Owns every counter/gauge named in the spec; constructed once and shared
/// by `Arc` across components, exactly like the teacher's `Metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
	pub request: RequestMetrics,
	pub connection: ConnectionMetrics,
	pub traffic: TrafficMetrics,
	pub pipeline: PipelineMetrics,
	pub cert_factory: CertFactoryMetrics,
	pub agent_pool: AgentPoolMetrics,
}

impl Metrics {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers every counter into a fresh [`Registry`] so an external
	/// collaborator can serve `/metrics` (spec's ambient-stack allowance;
	/// the HTTP exposition itself is out of scope).
	pub fn registry(&self) -> Registry {
		let mut registry = Registry::default();
		let req = registry.sub_registry_with_prefix("request");
		req.register("total", "total requests seen", self.request.total.clone());
		req.register(
			"success",
			"requests completed successfully",
			self.request.success.clone(),
		);
		req.register("error", "requests that ended in error", self.request.error.clone());
		req.register(
			"intercepted",
			"requests that ran the interception pipeline",
			self.request.intercepted.clone(),
		);

		let conn = registry.sub_registry_with_prefix("connection");
		conn.register("total", "total connections accepted", self.connection.total.clone());
		conn.register("active", "currently active connections", self.connection.active.clone());
		conn.register("ssl", "TLS-terminated connections", self.connection.ssl.clone());
		conn.register(
			"websocket",
			"WebSocket upgrade connections",
			self.connection.websocket.clone(),
		);
		conn.register(
			"reuse",
			"upstream sockets reused from the agent pool",
			self.connection.reuse.clone(),
		);
		conn.register("new", "new upstream sockets dialed", self.connection.new.clone());
		conn.register("timeout", "connections that timed out", self.connection.timeout.clone());
		conn.register("error", "connections that ended in error", self.connection.error.clone());

		let traffic = registry.sub_registry_with_prefix("traffic");
		traffic.register("bytes_in", "bytes received from clients", self.traffic.bytes_in.clone());
		traffic.register("bytes_out", "bytes sent to clients", self.traffic.bytes_out.clone());

		let pipeline = registry.sub_registry_with_prefix("pipeline");
		pipeline.register(
			"stage_executions",
			"middleware/interceptor stage invocations",
			self.pipeline.stage_executions.clone(),
		);
		pipeline.register(
			"stage_errors",
			"middleware/interceptor stage failures",
			self.pipeline.stage_errors.clone(),
		);
		pipeline.register(
			"stage_duration_micros_total",
			"cumulative middleware/interceptor stage duration in microseconds",
			self.pipeline.stage_duration_micros_total.clone(),
		);

		let cert = registry.sub_registry_with_prefix("cert_factory");
		cert.register(
			"synthesized",
			"leaf certificates synthesized",
			self.cert_factory.synthesized.clone(),
		);
		cert.register("cache_hits", "cert cache hits", self.cert_factory.cache_hits.clone());
		cert.register("evictions", "cert cache evictions", self.cert_factory.evictions.clone());

		let pool = registry.sub_registry_with_prefix("agent_pool");
		pool.register(
			"new_connections",
			"new upstream connections dialed",
			self.agent_pool.new_connections.clone(),
		);
		pool.register(
			"reuse_connections",
			"idle sockets reused",
			self.agent_pool.reuse_connections.clone(),
		);
		pool.register("timeouts", "pool request timeouts", self.agent_pool.timeouts.clone());
		pool.register("errors", "dial errors by kind", self.agent_pool.errors.clone());

		registry
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reuse_rate_is_zero_with_no_dials() {
		let m = AgentPoolMetrics::default();
		assert_eq!(m.reuse_rate(), 0.0);
	}

	#[test]
	fn reuse_rate_reflects_counters() {
		let m = AgentPoolMetrics::default();
		m.new_connections.inc();
		m.reuse_connections.inc();
		m.reuse_connections.inc();
		assert!((m.reuse_rate() - (2.0 / 3.0)).abs() < 1e-9);
	}
}
