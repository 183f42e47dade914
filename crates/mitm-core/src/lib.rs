//! Interception-capable HTTP/HTTPS/WebSocket forward proxy core.
//!
//! [`Proxy`] is the owning arena spec.md §9 calls for in place of the
//! source's cyclic `ProxyServer` ↔ manager references: it builds every
//! component in §4 and hands each one only the non-owning `Arc` handles it
//! needs. Everything else in this crate is one of those components.

pub mod cert;
pub mod config;
pub mod connect;
pub mod context;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod fakeserver;
pub mod hopbyhop;
pub mod listener;
pub mod pipeline;
pub mod policy;
pub mod pool;
pub mod telemetry;
pub mod upgrade;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::cert::{CertFactory, FixedCert, RootCa};
use crate::config::Config;
use crate::connect::ConnectHandler;
use crate::context::{ContextPool, SharedContextPool};
use crate::dialer::Dialer;
use crate::engine::RequestEngine;
use crate::error::CertError;
use crate::fakeserver::FakeServerPool;
use crate::listener::Router;
use crate::pipeline::{PipelineManager, PipelineStage};
use crate::policy::InterceptionPolicy;
use crate::pool::AgentPool;
use crate::telemetry::Metrics;
use crate::upgrade::UpgradeHandler;

/// Owns every long-lived component named in §4. Pipeline stage
/// implementations are supplied by the embedding application — writing
/// interceptors/middleware is this crate's non-goal (spec.md §1), so
/// `Proxy::new` takes them as an already-built `Vec`.
pub struct Proxy {
	pub metrics: Arc<Metrics>,
	pub root_ca: Arc<RootCa>,
	pub cert_factory: Arc<CertFactory>,
	pub fake_servers: Arc<FakeServerPool>,
	pub agent_pool: Arc<AgentPool>,
	pub policy: Arc<InterceptionPolicy>,
	pub pipeline: Arc<PipelineManager>,
	pub contexts: SharedContextPool,
	pub router: Arc<Router>,
	listen_addr: SocketAddr,
	cleanup_interval: std::time::Duration,
}

impl Proxy {
	pub fn new(config: Config, root_ca: RootCa, fixed_cert: Option<FixedCert>, stages: Vec<Arc<dyn PipelineStage>>) -> Result<Self, CertError> {
		let metrics = Arc::new(Metrics::new());
		let root_ca = Arc::new(root_ca);
		let cert_factory = Arc::new(CertFactory::new(
			root_ca.clone(),
			config.cert_factory.cache_capacity,
			config.cert_factory.cache_ttl,
			fixed_cert,
			metrics.clone(),
		)?);

		let dialer = Arc::new(Dialer::new(config.dialer.clone()));
		let agent_pool = Arc::new(AgentPool::new(
			dialer,
			config.agent_pool.max_in_use_per_origin,
			config.agent_pool.max_idle_per_origin,
			config.agent_pool.idle_ttl,
			config.agent_pool.request_timeout,
			metrics.clone(),
		));

		let policy = Arc::new(InterceptionPolicy::new(config.policy.clone()));
		let pipeline = Arc::new(PipelineManager::new(stages, &config.pipeline, metrics.clone()));
		let contexts: SharedContextPool = Arc::new(ContextPool::new(config.agent_pool.max_idle_per_origin));

		let engine = Arc::new(RequestEngine::new(policy.clone(), pipeline.clone(), agent_pool.clone(), contexts.clone(), metrics.clone()));

		// The Fake Server Pool needs a connection handler at construction
		// time, but that handler dispatches through the Router, which in
		// turn needs the pool (via the Connect Handler) — the cyclic
		// reference spec.md §9 calls out. Resolved with the arena/non-
		// owning-handle pattern it recommends: the pool is only ever given
		// a handle to a cell the Router is dropped into once built, never
		// a direct reference back to itself.
		let router_cell: Arc<OnceCell<Arc<Router>>> = Arc::new(OnceCell::new());
		let handler: crate::fakeserver::ConnectionHandler = {
			let router_cell = router_cell.clone();
			Arc::new(move |tls, peer| {
				let router_cell = router_cell.clone();
				Box::pin(async move {
					match router_cell.get() {
						Some(router) => listener::serve_fake_connection(tls, peer, router.clone()).await,
						None => tracing::error!("fake server accepted a connection before the router was initialized"),
					}
				})
			})
		};

		let fake_servers = Arc::new(FakeServerPool::new(cert_factory.clone(), config.fake_server.capacity, handler, metrics.clone()));
		let connect = Arc::new(ConnectHandler::new(
			policy.clone(),
			agent_pool.clone(),
			fake_servers.clone(),
			metrics.clone(),
			config.proxy_agent_name.clone(),
		));
		let upgrade = Arc::new(UpgradeHandler::new(pipeline.clone(), agent_pool.clone(), contexts.clone(), metrics.clone()));

		let router = Arc::new(Router::new(engine, connect, upgrade, metrics.clone()));
		let _ = router_cell.set(router.clone());

		Ok(Self {
			metrics,
			root_ca,
			cert_factory,
			fake_servers,
			agent_pool,
			policy,
			pipeline,
			contexts,
			router,
			listen_addr: SocketAddr::from(([0, 0, 0, 0], config.listen_port)),
			cleanup_interval: config.agent_pool.cleanup_interval,
		})
	}

	/// Starts the Agent Pool's idle-sweep background task and blocks
	/// serving the listening port named in spec.md §6 until `accept`
	/// fails.
	pub async fn run(&self) -> std::io::Result<()> {
		AgentPool::spawn_cleanup_task(self.agent_pool.clone(), self.cleanup_interval);
		listener::serve(self.listen_addr, self.router.clone()).await
	}
}
