//! Request Engine (spec.md §4.7): the plain-HTTP request lifecycle shared
//! by both the Listener (direct plaintext requests) and the Connect
//! Handler's intercepted path (requests arriving off a Fake Server).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;

use crate::context::{ModifiedRequest, ResponseParts, SharedContextPool};
use crate::dialer::UpstreamStream;
use crate::error::{DialError, PipelineError, ProxyError};
use crate::hopbyhop::strip_hop_by_hop;
use crate::pipeline::{Phase, PipelineManager};
use crate::policy::{Disposition, InterceptionPolicy};
use crate::pool::{AgentPool, OriginKey, PooledSocket};
use crate::telemetry::Metrics;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn box_body<B>(body: B) -> ProxyBody
where
	B: http_body::Body<Data = Bytes> + Send + 'static,
	B::Error: Into<BoxError>,
{
	body.map_err(Into::into).boxed()
}

pub fn full_body(bytes: Bytes) -> ProxyBody {
	box_body(Full::new(bytes))
}

pub struct RequestEngine {
	policy: Arc<InterceptionPolicy>,
	pipeline: Arc<PipelineManager>,
	pool: Arc<AgentPool>,
	contexts: SharedContextPool,
	metrics: Arc<Metrics>,
}

impl RequestEngine {
	pub fn new(
		policy: Arc<InterceptionPolicy>,
		pipeline: Arc<PipelineManager>,
		pool: Arc<AgentPool>,
		contexts: SharedContextPool,
		metrics: Arc<Metrics>,
	) -> Self {
		Self { policy, pipeline, pool, contexts, metrics }
	}

	/// Handles one HTTP request per spec.md §4.7. `ssl_flag` is true when
	/// this request arrived off a Fake Server (the CONNECT tunnel was
	/// terminated locally).
	pub async fn handle(&self, req: Request<Incoming>, ssl_flag: bool, client_addr: SocketAddr) -> Response<ProxyBody> {
		self.metrics.request.total.inc();

		let host = request_host(&req);
		let scheme = if ssl_flag { "https" } else { "http" };
		let path = req.uri().path().to_string();
		let port = req.uri().port_u16().unwrap_or(if ssl_flag { 443 } else { 80 });
		let full_url = format!("{scheme}://{host}{}", req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"));
		let disposition = self.policy.evaluate(&host, &full_url, Some(&path));
		let origin = OriginKey::new(scheme, host, port);

		let result = match disposition {
			Disposition::Tunnel => self.forward_tunnel(req, origin).await,
			Disposition::Intercept => self.forward_intercepted(req, origin, client_addr).await,
		};

		match result {
			Ok(resp) => {
				self.metrics.request.success.inc();
				resp
			},
			Err(err) => {
				self.metrics.request.error.inc();
				error_response(&err)
			},
		}
	}

	/// Straight proxy: headers forwarded verbatim (minus hop-by-hop), no
	/// pipeline run at all (spec.md §4.7 step 2).
	async fn forward_tunnel(&self, req: Request<Incoming>, origin: OriginKey) -> Result<Response<ProxyBody>, ProxyError> {
		let (mut parts, body) = req.into_parts();
		strip_hop_by_hop(&mut parts.headers);
		ensure_host_header(&mut parts.headers, &origin);
		let outbound = Request::from_parts(parts, box_body(body));
		let (resp, _buffered) = self.issue(outbound, origin, false).await?;
		Ok(resp)
	}

	/// Runs the full pipeline lifecycle (spec.md §4.7 steps 3-9).
	async fn forward_intercepted(
		&self,
		req: Request<Incoming>,
		origin: OriginKey,
		client_addr: SocketAddr,
	) -> Result<Response<ProxyBody>, ProxyError> {
		let _permit = self.pipeline.try_enter()?;
		let mut ctx = self.contexts.acquire(client_addr);
		ctx.method = req.method().clone();
		ctx.uri = req.uri().clone();
		ctx.headers = req.headers().clone();
		ctx.ssl_flag = origin.scheme.eq_ignore_ascii_case("https");

		let (_parts, body) = req.into_parts();
		ctx.body = match body.collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(_) => {
				self.contexts.release(ctx);
				return Err(ProxyError::Pipeline(PipelineError::ClientAborted));
			},
		};
		ctx.request_size = ctx.body.len() as u64;

		self.pipeline.run_phase(&mut ctx, Phase::BeforeRequest).await;

		let outcome = if ctx.direct_response.is_some() || ctx.stopped {
			if ctx.direct_response.is_some() {
				self.metrics.request.intercepted.inc();
			}
			ctx.intercepted = ctx.intercepted || ctx.direct_response.is_some();
			let parts = ctx.direct_response.clone().or_else(|| ctx.response.clone()).unwrap_or_else(synthetic_bad_gateway);
			self.pipeline.run_phase(&mut ctx, Phase::AfterResponse).await;
			Ok(response_parts_to_response(parts))
		} else {
			self.forward_modified(&mut ctx, origin).await
		};

		self.contexts.release(ctx);
		outcome
	}

	async fn forward_modified(
		&self,
		ctx: &mut crate::context::RequestContext,
		origin: OriginKey,
	) -> Result<Response<ProxyBody>, ProxyError> {
		let mut headers = ctx.headers.clone();
		let mut body = ctx.body.clone();
		if let Some(modified) = ctx.modified_request.clone() {
			apply_header_overrides(&mut headers, &modified);
			if let Some(new_body) = modified.body {
				body = new_body;
			}
		}
		strip_hop_by_hop(&mut headers);
		ensure_host_header(&mut headers, &origin);

		let mut builder = Request::builder().method(ctx.method.clone()).uri(ctx.uri.clone());
		if let Some(map) = builder.headers_mut() {
			*map = headers;
		}
		let outbound = builder
			.body(full_body(body))
			.map_err(|e| ProxyError::Pipeline(PipelineError::InterceptorError("engine".to_string(), e.to_string())))?;

		let buffer_response = self.pipeline.any_wants_response_body();
		let issued = self.issue(outbound, origin, buffer_response).await;

		match issued {
			Ok((resp, Some(buffered))) => {
				ctx.response = Some(buffered);
				self.pipeline.run_phase(ctx, Phase::BeforeResponse).await;
				let final_parts = ctx.response.clone().unwrap_or_else(synthetic_bad_gateway);
				self.pipeline.run_phase(ctx, Phase::AfterResponse).await;
				let _ = resp;
				Ok(response_parts_to_response(final_parts))
			},
			Ok((resp, None)) => {
				self.pipeline.run_phase(ctx, Phase::AfterResponse).await;
				Ok(resp)
			},
			Err(err) => {
				ctx.error = Some(err.clone());
				self.pipeline.run_phase(ctx, Phase::OnError).await;
				if ctx.error.is_none() {
					let parts = ctx.response.clone().unwrap_or_else(synthetic_bad_gateway);
					Ok(response_parts_to_response(parts))
				} else {
					Err(err)
				}
			},
		}
	}

	/// Acquires a socket from the Agent Pool, drives one HTTP/1.1 exchange
	/// over it, and decides whether to return the socket to the pool.
	///
	/// Streamed responses (`buffer_response = false`) return the socket to
	/// the pool immediately as closed rather than waiting for the body to
	/// drain before learning whether the connection stayed alive — trading
	/// reuse of that one socket for the ability to stream bytes to the
	/// client without buffering (spec.md §4.7 step 7).
	async fn issue(
		&self,
		req: Request<ProxyBody>,
		origin: OriginKey,
		buffer_response: bool,
	) -> Result<(Response<ProxyBody>, Option<ResponseParts>), ProxyError> {
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
		let conn_task = tokio::spawn(conn.without_shutdown());

		let send_result = sender.send_request(req).await;
		drop(sender);

		let response = match send_result {
			Ok(response) => response,
			Err(err) => {
				conn_task.abort();
				self.pool.release(socket, false);
				return Err(ProxyError::Dial(DialError::UpstreamProtocol(err.to_string())));
			},
		};

		if buffer_response {
			let (parts, body) = response.into_parts();
			let collected = match body.collect().await {
				Ok(c) => c.to_bytes(),
				Err(err) => {
					conn_task.abort();
					self.pool.release(socket, false);
					return Err(ProxyError::Dial(DialError::UpstreamProtocol(err.to_string())));
				},
			};
			match conn_task.await {
				Ok(Ok(parts_out)) => {
					let stream = parts_out.io.into_inner();
					self.pool.release(PooledSocket { origin: socket.origin.clone(), stream, reused: socket.reused }, true);
				},
				_ => self.pool.release(socket, false),
			}
			let rp = ResponseParts { status: parts.status, headers: parts.headers, body: collected };
			Ok((response_parts_to_response(rp.clone()), Some(rp)))
		} else {
			tokio::spawn(async move {
				let _ = conn_task.await;
			});
			self.pool.release(socket, false);
			let (parts, body) = response.into_parts();
			Ok((Response::from_parts(parts, box_body(body)), None))
		}
	}
}

fn apply_header_overrides(headers: &mut http::HeaderMap, modified: &ModifiedRequest) {
	for (name, value) in modified.headers.iter() {
		headers.insert(name.clone(), value.clone());
	}
}

fn request_host(req: &Request<Incoming>) -> String {
	req.uri()
		.host()
		.map(str::to_string)
		.or_else(|| req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).map(|s| s.split(':').next().unwrap_or(s).to_string()))
		.unwrap_or_default()
}

fn ensure_host_header(headers: &mut http::HeaderMap, origin: &OriginKey) {
	if let Ok(value) = HeaderValue::from_str(&format!("{}:{}", origin.host, origin.port)) {
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

fn synthetic_bad_gateway() -> ResponseParts {
	ResponseParts { status: http::StatusCode::BAD_GATEWAY, headers: http::HeaderMap::new(), body: Bytes::from_static(b"bad gateway") }
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
	use crate::config::InterceptionPolicyConfig;
	use crate::dialer::Dialer;
	use crate::pipeline::PipelineManager;
	use std::time::Duration;

	fn engine() -> RequestEngine {
		let policy = Arc::new(InterceptionPolicy::new(InterceptionPolicyConfig::default()));
		let metrics = Arc::new(Metrics::new());
		let pipeline = Arc::new(PipelineManager::new(vec![], &crate::config::PipelineConfig::default(), metrics.clone()));
		let dialer = Arc::new(Dialer::new(crate::config::DialerConfig::default()));
		let pool = Arc::new(AgentPool::new(dialer, 4, 4, Duration::from_secs(5), Duration::from_secs(5), metrics.clone()));
		let contexts = Arc::new(crate::context::ContextPool::new(4));
		RequestEngine::new(policy, pipeline, pool, contexts, metrics)
	}

	#[tokio::test]
	async fn ensure_host_header_sets_origin_authority() {
		let mut headers = http::HeaderMap::new();
		ensure_host_header(&mut headers, &OriginKey::new("http", "example.com", 8080));
		assert_eq!(headers.get(http::header::HOST).unwrap(), "example.com:8080");
	}

	#[test]
	fn engine_constructs_without_panicking() {
		let _ = engine();
	}
}
