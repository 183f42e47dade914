//! Agent Pool (spec.md §4.3): per-origin keep-alive socket pools with idle
//! eviction, bounded in-use/idle counts, and at-most-one-dial-per-key
//! coalescing for the common "no idle socket yet" case.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::timeout;

use crate::dialer::{Dialer, UpstreamStream};
use crate::error::{DialError, PoolError};
use crate::telemetry::Metrics;
use crate::telemetry::metrics::ResultLabel;

/// Identifies an upstream pool bucket (spec.md GLOSSARY "Origin key"). Two
/// keys differing only in `custom_socket_id` are disjoint pools, used for
/// stateful auth schemes like NTLM that pin a client to one socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
	pub scheme: String,
	pub host: String,
	pub port: u16,
	pub custom_socket_id: Option<String>,
}

impl OriginKey {
	pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
		Self { scheme: scheme.into(), host: host.into(), port, custom_socket_id: None }
	}

	pub fn with_socket_id(mut self, id: impl Into<String>) -> Self {
		self.custom_socket_id = Some(id.into());
		self
	}
}

struct IdleSocket {
	stream: UpstreamStream,
	last_used: Instant,
}

#[derive(Default)]
struct OriginBucket {
	idle: VecDeque<IdleSocket>,
	in_use: usize,
}

pub struct AgentPool {
	dialer: Arc<Dialer>,
	buckets: Mutex<HashMap<OriginKey, OriginBucket>>,
	max_in_use: usize,
	max_idle: usize,
	idle_ttl: Duration,
	request_timeout: Duration,
	metrics: Arc<Metrics>,
}

/// A socket checked out of the pool. Callers must call
/// [`AgentPool::release`] with the returned key and a `keep_alive` flag
/// once done; dropping it without releasing leaks the in-use slot
/// (mirrors the object-pool discipline used elsewhere in the core).
pub struct PooledSocket {
	pub origin: OriginKey,
	pub stream: UpstreamStream,
	pub reused: bool,
}

impl AgentPool {
	pub fn new(
		dialer: Arc<Dialer>,
		max_in_use: usize,
		max_idle: usize,
		idle_ttl: Duration,
		request_timeout: Duration,
		metrics: Arc<Metrics>,
	) -> Self {
		Self {
			dialer,
			buckets: Mutex::new(HashMap::new()),
			max_in_use,
			max_idle,
			idle_ttl,
			request_timeout,
			metrics,
		}
	}

	/// `acquire(origin_key)` per spec.md §4.3: an idle, healthy socket if
	/// one exists, otherwise a freshly dialed one via the Upstream Dialer.
	pub async fn acquire(&self, origin: OriginKey) -> Result<PooledSocket, PoolError> {
		if let Some(stream) = self.take_idle(&origin) {
			self.metrics.agent_pool.reuse_connections.inc();
			self.metrics.connection.reuse.inc();
			return Ok(PooledSocket { origin, stream, reused: true });
		}

		{
			let mut buckets = self.buckets.lock();
			let bucket = buckets.entry(origin.clone()).or_default();
			if bucket.in_use >= self.max_in_use {
				self.metrics.agent_pool.timeouts.inc();
				self.metrics.connection.timeout.inc();
				return Err(PoolError::RequestTimeout);
			}
			bucket.in_use += 1;
		}

		let dial_result = timeout(self.request_timeout, self.dialer.dial(&origin)).await.map_err(|_| {
			self.metrics.agent_pool.timeouts.inc();
			self.metrics.connection.timeout.inc();
			PoolError::Dial(DialError::ConnectTimeout(origin.host.clone()))
		})?;

		match dial_result {
			Ok(stream) => {
				self.metrics.agent_pool.new_connections.inc();
				self.metrics.connection.new.inc();
				Ok(PooledSocket { origin, stream, reused: false })
			},
			Err(err) => {
				let mut buckets = self.buckets.lock();
				if let Some(bucket) = buckets.get_mut(&origin) {
					bucket.in_use = bucket.in_use.saturating_sub(1);
				}
				self.metrics.agent_pool.errors.get_or_create(&ResultLabel { result: err.kind() }).inc();
				self.metrics.connection.error.inc();
				Err(PoolError::Dial(err))
			},
		}
	}

	/// `release(socket, origin_key, keep_alive)` per spec.md §4.3.
	pub fn release(&self, mut socket: PooledSocket, keep_alive: bool) {
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(socket.origin.clone()).or_default();
		bucket.in_use = bucket.in_use.saturating_sub(1);

		if keep_alive && bucket.idle.len() < self.max_idle {
			bucket.idle.push_back(IdleSocket { stream: std::mem::take(&mut socket.stream), last_used: Instant::now() });
		}
		// else: `socket.stream` drops here, closing it.
	}

	fn take_idle(&self, origin: &OriginKey) -> Option<UpstreamStream> {
		let mut buckets = self.buckets.lock();
		let bucket = buckets.get_mut(origin)?;
		while let Some(idle) = bucket.idle.pop_front() {
			if idle.last_used.elapsed() <= self.idle_ttl {
				bucket.in_use += 1;
				return Some(idle.stream);
			}
			// expired; drop and keep scanning
		}
		None
	}

	/// Scans idle lists and drops sockets past `idle_ttl`; intended to run
	/// on a `cleanup_interval` timer (spec.md §4.3 "background task").
	pub fn sweep_idle(&self) {
		let mut buckets = self.buckets.lock();
		for bucket in buckets.values_mut() {
			bucket.idle.retain(|s| s.last_used.elapsed() <= self.idle_ttl);
		}
	}

	pub fn idle_count(&self, origin: &OriginKey) -> usize {
		self.buckets.lock().get(origin).map(|b| b.idle.len()).unwrap_or(0)
	}

	pub fn in_use_count(&self, origin: &OriginKey) -> usize {
		self.buckets.lock().get(origin).map(|b| b.in_use).unwrap_or(0)
	}

	/// Runs [`Self::sweep_idle`] on `cleanup_interval` until `pool` is
	/// dropped (detected via the weak upgrade failing).
	pub fn spawn_cleanup_task(pool: Arc<AgentPool>, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let weak = Arc::downgrade(&pool);
			drop(pool);
			let mut ticker = tokio::time::interval(cleanup_interval);
			loop {
				ticker.tick().await;
				match weak.upgrade() {
					Some(pool) => pool.sweep_idle(),
					None => break,
				}
			}
		})
	}
}

impl Default for UpstreamStream {
	fn default() -> Self {
		UpstreamStream::closed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::DialerConfig;

	fn test_pool() -> AgentPool {
		let dialer = Arc::new(Dialer::new(DialerConfig::default()));
		AgentPool::new(dialer, 2, 2, Duration::from_millis(50), Duration::from_secs(1), Arc::new(Metrics::new()))
	}

	#[test]
	fn origin_keys_with_different_socket_ids_are_disjoint() {
		let a = OriginKey::new("http", "example.com", 80).with_socket_id("session-a");
		let b = OriginKey::new("http", "example.com", 80).with_socket_id("session-b");
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn idle_sockets_expire_after_ttl() {
		let pool = test_pool();
		let origin = OriginKey::new("http", "example.com", 80);
		pool.release(
			PooledSocket { origin: origin.clone(), stream: UpstreamStream::closed(), reused: false },
			true,
		);
		assert_eq!(pool.idle_count(&origin), 1);
		tokio::time::sleep(Duration::from_millis(80)).await;
		assert!(pool.take_idle(&origin).is_none());
	}
}
