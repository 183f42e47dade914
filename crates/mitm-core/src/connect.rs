//! Connect Handler (spec.md §4.8): CONNECT tunneling with selective TLS
//! interception.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::engine::{ProxyBody, full_body};
use crate::error::{DialError, FakeServerError, PoolError, ProxyError};
use crate::fakeserver::FakeServerPool;
use crate::policy::{Disposition, InterceptionPolicy};
use crate::pool::{AgentPool, OriginKey, PooledSocket};
use crate::telemetry::Metrics;

pub struct ConnectHandler {
	policy: Arc<InterceptionPolicy>,
	pool: Arc<AgentPool>,
	fake_servers: Arc<FakeServerPool>,
	metrics: Arc<Metrics>,
	proxy_agent_name: String,
}

impl ConnectHandler {
	pub fn new(
		policy: Arc<InterceptionPolicy>,
		pool: Arc<AgentPool>,
		fake_servers: Arc<FakeServerPool>,
		metrics: Arc<Metrics>,
		proxy_agent_name: String,
	) -> Self {
		Self { policy, pool, fake_servers, metrics, proxy_agent_name }
	}

	/// Handles a `CONNECT host:port HTTP/1.1` request. On success returns a
	/// `200 Connection Established` whose upgrade continuation performs the
	/// tunnel/intercept splice; on failure returns a short plaintext error
	/// response per spec.md §4.8 point 4.
	pub async fn handle(&self, req: Request<Incoming>, _client_addr: SocketAddr) -> Response<ProxyBody> {
		let authority = match req.uri().authority().map(|a| a.to_string()).or_else(|| req.uri().host().map(|h| h.to_string())) {
			Some(a) => a,
			None => return error_response(StatusCode::BAD_REQUEST, "CONNECT request missing authority"),
		};
		let Some((host, port)) = split_host_port(&authority) else {
			return error_response(StatusCode::BAD_REQUEST, "CONNECT authority missing port");
		};

		let disposition = self.policy.evaluate(&host, &authority, None);
		self.metrics.connection.total.inc();

		match disposition {
			Disposition::Tunnel => self.handle_tunnel(req, host, port).await,
			Disposition::Intercept => self.handle_intercept(req, host, port).await,
		}
	}

	/// Dials the upstream *before* responding, so a dial failure can still
	/// be surfaced as a pre-`200` error status (spec.md §4.8 point 4). Only
	/// the splice itself waits on [`hyper::upgrade::on`], since that future
	/// only resolves once this response has been flushed to the client.
	async fn handle_tunnel(&self, req: Request<Incoming>, host: String, port: u16) -> Response<ProxyBody> {
		let origin = OriginKey::new("tcp", host.clone(), port);
		let socket = match self.pool.acquire(origin).await {
			Ok(s) => s,
			Err(err) => {
				tracing::warn!(%host, port, error = %err, "CONNECT tunnel dial failed");
				return error_response(pool_error_status(&err), &err.to_string());
			},
		};
		self.metrics.connection.ssl.inc();
		let pool = self.pool.clone();
		let metrics = self.metrics.clone();
		tokio::spawn(async move {
			match hyper::upgrade::on(req).await {
				Ok(upgraded) => splice_tunnel(upgraded, socket, pool, metrics).await,
				Err(err) => {
					tracing::debug!(error = %err, "CONNECT upgrade failed");
					pool.release(socket, false);
				},
			}
		});
		established_response(&self.proxy_agent_name)
	}

	async fn handle_intercept(&self, req: Request<Incoming>, host: String, port: u16) -> Response<ProxyBody> {
		let fake_addr = match self.fake_servers.get_or_create(&host, port).await {
			Ok(addr) => addr,
			Err(err) => {
				tracing::warn!(%host, error = %err, "fake server pool failed to produce an endpoint");
				return error_response(fake_server_error_status(&err), &err.to_string());
			},
		};
		let local = match TcpStream::connect(fake_addr).await {
			Ok(s) => s,
			Err(err) => {
				tracing::warn!(%fake_addr, error = %err, "failed to reach local fake server");
				return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to reach local TLS terminator");
			},
		};
		let metrics = self.metrics.clone();
		tokio::spawn(async move {
			match hyper::upgrade::on(req).await {
				Ok(upgraded) => {
					let mut client_io = TokioIo::new(upgraded);
					let mut local = local;
					if let Ok((from_client, from_upstream)) = tokio::io::copy_bidirectional(&mut client_io, &mut local).await {
						metrics.traffic.bytes_in.inc_by(from_client);
						metrics.traffic.bytes_out.inc_by(from_upstream);
					}
				},
				Err(err) => tracing::debug!(error = %err, "CONNECT upgrade failed"),
			}
		});
		established_response(&self.proxy_agent_name)
	}
}

async fn splice_tunnel(upgraded: hyper::upgrade::Upgraded, socket: PooledSocket, pool: Arc<AgentPool>, metrics: Arc<Metrics>) {
	let mut client_io = TokioIo::new(upgraded);
	let mut socket = socket;
	let result = tokio::io::copy_bidirectional(&mut client_io, &mut socket.stream).await;
	if let Ok((from_client, from_upstream)) = &result {
		metrics.traffic.bytes_in.inc_by(*from_client);
		metrics.traffic.bytes_out.inc_by(*from_upstream);
	}
	// Only a clean bidirectional EOF is eligible for reuse (spec.md §4.8
	// point 2: "only when the client signals completion cleanly").
	pool.release(socket, result.is_ok());
}

fn split_host_port(authority: &str) -> Option<(String, u16)> {
	let (host, port) = authority.rsplit_once(':')?;
	let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
	let port: u16 = port.parse().ok()?;
	Some((host, port))
}

// `http::StatusCode` has no way to carry a non-canonical reason phrase, so
// this is the plain `200 OK` status line rather than the literal
// `Connection Established` text some proxies emit; clients key off the
// status code, not the reason phrase, so this is a spec.md §4.8 fidelity
// gap without behavioral consequence.
fn established_response(proxy_agent_name: &str) -> Response<ProxyBody> {
	Response::builder()
		.status(StatusCode::OK)
		.header("Proxy-agent", proxy_agent_name)
		.body(full_body(Bytes::new()))
		.unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
	Response::builder().status(status).body(full_body(Bytes::from(message.to_string()))).unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

/// Maps a dial failure to the status codes named in spec.md §4.8 point 4.
fn dial_error_status(err: &DialError) -> StatusCode {
	match err {
		DialError::ConnectionRefused(_) => StatusCode::BAD_GATEWAY,
		DialError::ConnectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
		DialError::HostUnreachable(_) => StatusCode::BAD_GATEWAY,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

fn pool_error_status(err: &PoolError) -> StatusCode {
	match err {
		PoolError::Dial(d) => dial_error_status(d),
		PoolError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
	}
}

fn fake_server_error_status(_err: &FakeServerError) -> StatusCode {
	StatusCode::INTERNAL_SERVER_ERROR
}

/// Used by callers outside this module that need to map a composed
/// [`ProxyError`] (e.g. from the pipeline's `onError` phase) to a status.
pub fn proxy_error_status(err: &ProxyError) -> StatusCode {
	err.status_code().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_host_port_parses_authority() {
		assert_eq!(split_host_port("example.com:443"), Some(("example.com".to_string(), 443)));
	}

	#[test]
	fn split_host_port_rejects_missing_port() {
		assert_eq!(split_host_port("example.com"), None);
	}

	#[test]
	fn split_host_port_handles_bracketed_ipv6() {
		assert_eq!(split_host_port("[::1]:8443"), Some(("::1".to_string(), 8443)));
	}
}
