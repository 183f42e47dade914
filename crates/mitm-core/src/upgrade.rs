//! Upgrade Handler (spec.md §4.9): WebSocket (and other `Connection:
//! Upgrade`) requests. The core never parses the upgraded protocol; once
//! the upstream answers `101 Switching Protocols` both sockets are spliced
//! as raw byte streams for the remainder of the session.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;

use crate::context::{ModifiedRequest, ResponseParts, SharedContextPool};
use crate::engine::{ProxyBody, box_body, full_body};
use crate::error::{DialError, PipelineError, ProxyError};
use crate::pipeline::{Phase, PipelineManager};
use crate::pool::{AgentPool, OriginKey};
use crate::telemetry::Metrics;

/// True when the request carries `Connection: ... upgrade ...` and an
/// `Upgrade` header, per RFC 7230 §6.7 — the Listener uses this to route
/// to [`UpgradeHandler`] instead of the Request Engine.
pub fn wants_upgrade(req: &Request<Incoming>) -> bool {
	let has_upgrade_header = req.headers().contains_key(http::header::UPGRADE);
	let connection_says_upgrade = req
		.headers()
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"));
	has_upgrade_header && connection_says_upgrade
}

pub struct UpgradeHandler {
	pipeline: Arc<PipelineManager>,
	pool: Arc<AgentPool>,
	contexts: SharedContextPool,
	metrics: Arc<Metrics>,
}

impl UpgradeHandler {
	pub fn new(pipeline: Arc<PipelineManager>, pool: Arc<AgentPool>, contexts: SharedContextPool, metrics: Arc<Metrics>) -> Self {
		Self { pipeline, pool, contexts, metrics }
	}

	/// Handles one `Connection: Upgrade` request per spec.md §4.9.
	pub async fn handle(&self, req: Request<Incoming>, origin: OriginKey, client_addr: SocketAddr) -> Response<ProxyBody> {
		self.metrics.request.total.inc();

		let permit = match self.pipeline.try_enter() {
			Ok(p) => p,
			Err(err) => return error_response(&ProxyError::Pipeline(err)),
		};

		let mut ctx = self.contexts.acquire(client_addr);
		ctx.method = req.method().clone();
		ctx.uri = req.uri().clone();
		ctx.headers = req.headers().clone();
		ctx.ssl_flag = origin.scheme.eq_ignore_ascii_case("https");

		self.pipeline.run_phase(&mut ctx, Phase::InterceptUpgrade).await;

		if ctx.direct_response.is_some() || ctx.stopped {
			let parts = ctx.direct_response.clone().unwrap_or_else(upgrade_rejected);
			self.contexts.release(ctx);
			drop(permit);
			return response_parts_to_response(parts);
		}

		let mut method = ctx.method.clone();
		let mut uri = ctx.uri.clone();
		let mut headers = ctx.headers.clone();
		if let Some(modified) = ctx.modified_request.clone() {
			apply_header_overrides(&mut headers, &modified);
			if let Some(u) = modified.url {
				uri = u;
			}
			if let Some(m) = modified.method {
				method = m;
			}
		}
		self.contexts.release(ctx);

		let result = self.relay(req, method, uri, headers, origin).await;
		drop(permit);
		match result {
			Ok(resp) => resp,
			Err(err) => {
				self.metrics.request.error.inc();
				error_response(&err)
			},
		}
	}

	/// Dials upstream, forwards the (possibly modified) upgrade request,
	/// and on a `101` response hands both sockets off to a background
	/// splice task before returning the `101` to the client. A non-`101`
	/// upstream response is forwarded to the client as an ordinary
	/// response and no splice occurs.
	async fn relay(
		&self,
		req: Request<Incoming>,
		method: Method,
		uri: Uri,
		mut headers: HeaderMap,
		origin: OriginKey,
	) -> Result<Response<ProxyBody>, ProxyError> {
		ensure_host_header(&mut headers, &origin);

		let mut socket = self.pool.acquire(origin).await.map_err(ProxyError::Pool)?;
		let raw = std::mem::take(&mut socket.stream);
		let io = TokioIo::new(raw);

		let (mut sender, conn) = match hyper::client::conn::http1::Builder::new().handshake::<_, ProxyBody>(io).await {
			Ok(pair) => pair,
			Err(err) => {
				self.pool.release(socket, false);
				return Err(ProxyError::Dial(DialError::UpstreamProtocol(err.to_string())));
			},
		};
		// The conn future drives the handshake through to the upgrade and
		// then exits on its own; nothing downstream needs its `Parts`.
		tokio::spawn(conn);

		let mut builder = Request::builder().method(method).uri(uri);
		if let Some(map) = builder.headers_mut() {
			*map = headers;
		}
		let outbound = match builder.body(full_body(Bytes::new())) {
			Ok(r) => r,
			Err(err) => {
				self.pool.release(socket, false);
				return Err(ProxyError::Dial(DialError::UpstreamProtocol(err.to_string())));
			},
		};

		let upstream_response = match sender.send_request(outbound).await {
			Ok(r) => r,
			Err(err) => {
				self.pool.release(socket, false);
				return Err(ProxyError::Dial(DialError::UpstreamProtocol(err.to_string())));
			},
		};
		drop(sender);

		if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
			self.pool.release(socket, false);
			let (parts, body) = upstream_response.into_parts();
			return Ok(Response::from_parts(parts, box_body(body)));
		}
		self.metrics.connection.websocket.inc();

		let (parts, body) = upstream_response.into_parts();
		let client_status = parts.status;
		let client_headers = parts.headers.clone();
		let upstream_for_upgrade = Response::from_parts(parts, body);

		let upstream_upgraded = match hyper::upgrade::on(upstream_for_upgrade).await {
			Ok(u) => u,
			Err(err) => {
				self.pool.release(socket, false);
				return Err(ProxyError::Dial(DialError::UpstreamProtocol(err.to_string())));
			},
		};

		let pool = self.pool.clone();
		let metrics = self.metrics.clone();
		tokio::spawn(async move {
			match hyper::upgrade::on(req).await {
				Ok(client_upgraded) => {
					let mut client_io = TokioIo::new(client_upgraded);
					let mut upstream_io = TokioIo::new(upstream_upgraded);
					// Half-close propagation falls out of `copy_bidirectional`
					// itself: each direction shuts its write half down once
					// its read half hits EOF (spec.md §4.9 point 4).
					if let Ok((from_client, from_upstream)) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
						metrics.traffic.bytes_in.inc_by(from_client);
						metrics.traffic.bytes_out.inc_by(from_upstream);
					}
				},
				Err(err) => tracing::debug!(error = %err, "upgrade failed on the client side after upstream accepted"),
			}
			pool.release(socket, false);
		});

		let mut builder = Response::builder().status(client_status);
		if let Some(map) = builder.headers_mut() {
			*map = client_headers;
		}
		Ok(builder.body(full_body(Bytes::new())).unwrap_or_else(|_| Response::new(full_body(Bytes::new()))))
	}
}

fn apply_header_overrides(headers: &mut HeaderMap, modified: &ModifiedRequest) {
	for (name, value) in modified.headers.iter() {
		headers.insert(name.clone(), value.clone());
	}
}

fn ensure_host_header(headers: &mut HeaderMap, origin: &OriginKey) {
	if let Ok(value) = http::HeaderValue::from_str(&format!("{}:{}", origin.host, origin.port)) {
		headers.insert(http::header::HOST, value);
	}
}

fn response_parts_to_response(parts: ResponseParts) -> Response<ProxyBody> {
	let mut builder = Response::builder().status(parts.status);
	if let Some(map) = builder.headers_mut() {
		*map = parts.headers;
	}
	builder.body(full_body(parts.body)).unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn upgrade_rejected() -> ResponseParts {
	ResponseParts { status: StatusCode::BAD_GATEWAY, headers: HeaderMap::new(), body: Bytes::from_static(b"upgrade rejected") }
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
	match err.status_code() {
		Some(status) => Response::builder()
			.status(status)
			.body(full_body(Bytes::from(err.client_message())))
			.unwrap_or_else(|_| Response::new(full_body(Bytes::new()))),
		None => Response::new(full_body(Bytes::new())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request_with(headers: &[(&str, &str)]) -> http::request::Parts {
		let mut builder = Request::builder().method(Method::GET).uri("/ws");
		for (name, value) in headers {
			builder = builder.header(*name, *value);
		}
		builder.body(()).unwrap().into_parts().0
	}

	fn parts_to_incoming_shaped_check(parts: &http::request::Parts) -> bool {
		let connection_says_upgrade = parts
			.headers
			.get_all(http::header::CONNECTION)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(','))
			.any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"));
		parts.headers.contains_key(http::header::UPGRADE) && connection_says_upgrade
	}

	#[test]
	fn websocket_upgrade_headers_are_detected() {
		let parts = request_with(&[("Connection", "Upgrade"), ("Upgrade", "websocket")]);
		assert!(parts_to_incoming_shaped_check(&parts));
	}

	#[test]
	fn missing_upgrade_header_is_not_detected() {
		let parts = request_with(&[("Connection", "Upgrade")]);
		assert!(!parts_to_incoming_shaped_check(&parts));
	}

	#[test]
	fn connection_keep_alive_is_not_an_upgrade() {
		let parts = request_with(&[("Connection", "keep-alive"), ("Upgrade", "websocket")]);
		assert!(!parts_to_incoming_shaped_check(&parts));
	}
}
