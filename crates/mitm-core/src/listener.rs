//! Listener (spec.md §6): the single plaintext HTTP/1.1 TCP port that
//! accepts ordinary requests, `CONNECT`, and `Connection: Upgrade`. The
//! same classify-and-dispatch logic runs again, with `ssl_flag = true`,
//! over each Fake Server connection once its local TLS handshake
//! completes (spec.md §4.2) — both paths share one [`Router`].

use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;

use crate::connect::ConnectHandler;
use crate::engine::{ProxyBody, RequestEngine};
use crate::fakeserver::ConnectionHandler;
use crate::pool::OriginKey;
use crate::telemetry::Metrics;
use crate::upgrade::{UpgradeHandler, wants_upgrade};

/// Routes one already-decoded request to the component named in spec.md
/// §6: `CONNECT` to the Connect Handler, `Connection: Upgrade` to the
/// Upgrade Handler, everything else to the Request Engine.
pub struct Router {
	engine: Arc<RequestEngine>,
	connect: Arc<ConnectHandler>,
	upgrade: Arc<UpgradeHandler>,
	metrics: Arc<Metrics>,
}

impl Router {
	pub fn new(engine: Arc<RequestEngine>, connect: Arc<ConnectHandler>, upgrade: Arc<UpgradeHandler>, metrics: Arc<Metrics>) -> Self {
		Self { engine, connect, upgrade, metrics }
	}

	pub async fn route(&self, req: Request<Incoming>, ssl_flag: bool, client_addr: SocketAddr) -> Response<ProxyBody> {
		if req.method() == Method::CONNECT {
			return self.connect.handle(req, client_addr).await;
		}
		if wants_upgrade(&req) {
			let origin = request_origin(&req, ssl_flag);
			return self.upgrade.handle(req, origin, client_addr).await;
		}
		self.engine.handle(req, ssl_flag, client_addr).await
	}
}

fn request_origin(req: &Request<Incoming>, ssl_flag: bool) -> OriginKey {
	let scheme = if ssl_flag { "https" } else { "http" };
	let host = req
		.uri()
		.host()
		.map(str::to_string)
		.or_else(|| req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).map(|s| s.split(':').next().unwrap_or(s).to_string()))
		.unwrap_or_default();
	let port = req.uri().port_u16().unwrap_or(if ssl_flag { 443 } else { 80 });
	OriginKey::new(scheme, host, port)
}

/// Runs the listening TCP port named in spec.md §6 until `accept` returns
/// an error (the caller decides whether that's fatal).
pub async fn serve(listen_addr: SocketAddr, router: Arc<Router>) -> std::io::Result<()> {
	let listener = TcpListener::bind(listen_addr).await?;
	tracing::info!(%listen_addr, "listening");
	loop {
		let (stream, peer) = listener.accept().await?;
		let router = router.clone();
		tokio::spawn(async move {
			serve_plaintext_connection(stream, peer, router).await;
		});
	}
}

async fn serve_plaintext_connection(stream: TcpStream, peer: SocketAddr, router: Arc<Router>) {
	let metrics = router.metrics.clone();
	metrics.connection.active.inc();
	let io = TokioIo::new(stream);
	let service = service_fn(move |req| {
		let router = router.clone();
		async move { Ok::<_, std::convert::Infallible>(router.route(req, false, peer).await) }
	});
	if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
		tracing::debug!(error = %err, "plaintext connection ended");
	}
	metrics.connection.active.dec();
}

/// Serves one already TLS-terminated Fake Server connection with
/// `ssl_flag = true` (spec.md §4.2) — the counterpart to
/// [`serve_plaintext_connection`] for the listener's own port.
pub async fn serve_fake_connection(tls: TlsStream<TcpStream>, peer: SocketAddr, router: Arc<Router>) {
	let metrics = router.metrics.clone();
	metrics.connection.active.inc();
	let io = TokioIo::new(tls);
	let service = service_fn(move |req| {
		let router = router.clone();
		async move { Ok::<_, std::convert::Infallible>(router.route(req, true, peer).await) }
	});
	if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
		tracing::debug!(error = %err, "fake server connection ended");
	}
	metrics.connection.active.dec();
}

/// Builds the [`ConnectionHandler`] the Fake Server Pool invokes per
/// accepted connection, for callers that already have a [`Router`] in
/// hand. [`Proxy`](crate::Proxy) instead resolves the handle lazily,
/// since the pool that needs this handler is itself one of the Router's
/// dependencies (spec.md §9's arena/non-owning-handle guidance).
pub fn fake_server_handler(router: Arc<Router>) -> ConnectionHandler {
	Arc::new(move |tls: TlsStream<TcpStream>, peer: SocketAddr| {
		let router = router.clone();
		Box::pin(serve_fake_connection(tls, peer, router))
	})
}
