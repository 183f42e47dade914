//! Fake Server Pool (spec.md §4.2): a bounded, true-LRU pool of local TLS
//! terminator endpoints, one per mintable hostname but reusable across any
//! hostname covered by the same SAN set.

pub mod resolver;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use proxy_core::SingleFlight;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::cert::CertFactory;
use crate::error::FakeServerError;
use crate::fakeserver::resolver::FactoryResolver;
use crate::telemetry::Metrics;

/// Invoked once per accepted, TLS-terminated connection to a fake server;
/// feeds the plaintext request/upgrade events back into the Request Engine
/// or Upgrade Handler with `ssl_flag = true`, per spec.md §4.2.
pub type ConnectionHandler =
	Arc<dyn Fn(TlsStream<TcpStream>, SocketAddr) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
	local_addr: SocketAddr,
	san_set: Vec<String>,
	accept_loop: Arc<JoinHandle<()>>,
}

struct FakeServerEntry {
	registration: Registration,
	last_used: Instant,
}

fn san_covers(san_set: &[String], hostname: &str) -> bool {
	san_set.iter().any(|san| {
		if san == hostname {
			return true;
		}
		if let Some(parent) = san.strip_prefix("*.") {
			return hostname
				.strip_suffix(parent)
				.is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1);
		}
		false
	})
}

pub struct FakeServerPool {
	cert_factory: Arc<CertFactory>,
	entries: Mutex<HashMap<String, FakeServerEntry>>,
	inflight: SingleFlight<String, Registration, FakeServerError>,
	capacity: usize,
	handler: ConnectionHandler,
	metrics: Arc<Metrics>,
}

impl FakeServerPool {
	pub fn new(
		cert_factory: Arc<CertFactory>,
		capacity: usize,
		handler: ConnectionHandler,
		metrics: Arc<Metrics>,
	) -> Self {
		Self {
			cert_factory,
			entries: Mutex::new(HashMap::new()),
			inflight: SingleFlight::new(),
			capacity,
			handler,
			metrics,
		}
	}

	/// `get_or_create(hostname, port)` per spec.md §4.2. Returns the local
	/// address the Connect Handler should redirect tunneled bytes to.
	pub async fn get_or_create(&self, hostname: &str, _port: u16) -> Result<SocketAddr, FakeServerError> {
		if let Some(addr) = self.lookup_and_touch(hostname) {
			return Ok(addr);
		}

		let cert_factory = self.cert_factory.clone();
		let handler = self.handler.clone();
		let key = hostname.to_string();
		let registration = self
			.inflight
			.get_or_try_init(key.clone(), move || create_listener(cert_factory, key, handler))
			.await?;

		let addr = registration.local_addr;
		self.register(hostname.to_string(), registration);
		Ok(addr)
	}

	fn lookup_and_touch(&self, hostname: &str) -> Option<SocketAddr> {
		let mut entries = self.entries.lock();
		let key = entries
			.iter()
			.find(|(_, e)| san_covers(&e.registration.san_set, hostname))
			.map(|(k, _)| k.clone())?;
		let entry = entries.get_mut(&key)?;
		entry.last_used = Instant::now();
		Some(entry.registration.local_addr)
	}

	/// Idempotent: concurrent callers coalesced by `inflight` all observe
	/// the same `Registration` and race to register it; the first wins,
	/// later callers are no-ops (the shared listener keeps running either
	/// way, so there is nothing to abort on the losing side).
	fn register(&self, key: String, registration: Registration) {
		let mut entries = self.entries.lock();
		if entries.contains_key(&key) {
			return;
		}
		if entries.len() >= self.capacity {
			if let Some(oldest) = entries
				.iter()
				.min_by_key(|(_, e)| e.last_used)
				.map(|(k, _)| k.clone())
			{
				if let Some(evicted) = entries.remove(&oldest) {
					// Graceful close: stop accepting; connections already
					// handed off to their own tasks drain independently.
					evicted.registration.accept_loop.abort();
				}
			}
		}
		entries.insert(key, FakeServerEntry { registration, last_used: Instant::now() });
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

async fn create_listener(
	cert_factory: Arc<CertFactory>,
	hostname: String,
	handler: ConnectionHandler,
) -> Result<Registration, FakeServerError> {
	let leaf = cert_factory.get_cert(&hostname, None).await?;

	let listener = TcpListener::bind(("127.0.0.1", 0))
		.await
		.map_err(|e| FakeServerError::ListenFailed(e.to_string()))?;
	let local_addr = listener
		.local_addr()
		.map_err(|e| FakeServerError::ListenFailed(e.to_string()))?;

	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
	let resolver = Arc::new(FactoryResolver::new(cert_factory.clone(), hostname.clone()));
	let server_config = rustls::ServerConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()
		.map_err(|e| FakeServerError::ListenFailed(e.to_string()))?
		.with_no_client_auth()
		.with_cert_resolver(resolver);
	let acceptor = TlsAcceptor::from(Arc::new(server_config));

	let accept_loop = Arc::new(tokio::spawn(accept_loop(listener, acceptor, handler)));

	Ok(Registration { local_addr, san_set: leaf.san_set, accept_loop })
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, handler: ConnectionHandler) {
	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(pair) => pair,
			Err(err) => {
				tracing::warn!(error = %err, "fake server accept failed");
				continue;
			},
		};
		let acceptor = acceptor.clone();
		let handler = handler.clone();
		tokio::spawn(async move {
			match acceptor.accept(stream).await {
				Ok(tls) => handler(tls, peer).await,
				Err(err) => tracing::debug!(error = %err, "fake server TLS handshake failed"),
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn san_covers_exact_and_wildcard() {
		let sans = vec!["a.example.com".to_string(), "*.example.com".to_string()];
		assert!(san_covers(&sans, "a.example.com"));
		assert!(san_covers(&sans, "b.example.com"));
		assert!(!san_covers(&sans, "example.com"));
		assert!(!san_covers(&sans, "evil-a.example.com.attacker.net"));
	}
}
