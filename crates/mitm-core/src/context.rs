//! Request Context (spec.md §3 + §4.9 Context + Object Pool): the reusable
//! per-request value object. Acquired from a free pool at accept time,
//! mutated exclusively by the currently-executing pipeline stage, reset on
//! release. Never shared across requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use proxy_core::ObjectPool;
use tracing::Span;

use crate::cert::FixedCert;
use crate::error::ProxyError;
use crate::telemetry::log;

/// A type-erased piece of per-request state middleware can stash and later
/// retrieve (spec.md §3 `meta_bag`).
#[derive(Default)]
pub struct MetaBag(HashMap<String, String>);

impl MetaBag {
	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.0.insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	fn clear(&mut self) {
		self.0.clear();
	}
}

/// A response produced either by the origin or by a `DirectResponse`
/// decision.
#[derive(Clone)]
pub struct ResponseParts {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// Accumulated `ModifyAndForward` delta (spec.md §3 accumulation rule):
/// headers merge later-wins, `url`/`method`/`body` last-wins.
#[derive(Default, Clone)]
pub struct ModifiedRequest {
	pub headers: HeaderMap,
	pub url: Option<Uri>,
	pub method: Option<Method>,
	pub body: Option<Bytes>,
}

impl ModifiedRequest {
	pub fn merge(&mut self, delta: ModifiedRequest) {
		for (name, value) in delta.headers.iter() {
			self.headers.insert(name.clone(), value.clone());
		}
		if delta.url.is_some() {
			self.url = delta.url;
		}
		if delta.method.is_some() {
			self.method = delta.method;
		}
		if delta.body.is_some() {
			self.body = delta.body;
		}
	}

	fn clear(&mut self) {
		self.headers.clear();
		self.url = None;
		self.method = None;
		self.body = None;
	}
}

/// Per-request context (spec.md §3 `Request Context`).
pub struct RequestContext {
	pub request_id: u64,
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub response: Option<ResponseParts>,
	pub ssl_flag: bool,
	pub start_time: Instant,
	pub stopped: bool,
	pub intercepted: bool,
	pub meta_bag: MetaBag,
	pub request_size: u64,
	pub response_size: u64,
	pub error: Option<ProxyError>,
	pub modified_request: Option<ModifiedRequest>,
	pub direct_response: Option<ResponseParts>,
	pub fixed_cert_override: Option<FixedCert>,
	pub span: Span,
}

impl RequestContext {
	fn blank() -> Self {
		Self {
			request_id: 0,
			method: Method::GET,
			uri: Uri::default(),
			headers: HeaderMap::new(),
			body: Bytes::new(),
			response: None,
			ssl_flag: false,
			start_time: Instant::now(),
			stopped: false,
			intercepted: false,
			meta_bag: MetaBag::default(),
			request_size: 0,
			response_size: 0,
			error: None,
			modified_request: None,
			direct_response: None,
			fixed_cert_override: None,
			span: Span::none(),
		}
	}

	fn reset(&mut self) {
		self.request_id = 0;
		self.method = Method::GET;
		self.uri = Uri::default();
		self.headers.clear();
		self.body = Bytes::new();
		self.response = None;
		self.ssl_flag = false;
		self.start_time = Instant::now();
		self.stopped = false;
		self.intercepted = false;
		self.meta_bag.clear();
		self.request_size = 0;
		self.response_size = 0;
		self.error = None;
		self.modified_request = None;
		self.direct_response = None;
		self.fixed_cert_override = None;
		self.span = Span::none();
	}

	#[cfg(test)]
	pub(crate) fn test_blank() -> Self {
		Self::blank()
	}

	/// Accumulates a `ModifyAndForward` delta and mirrors the effective
	/// url/method onto the context's own fields so later stages observe
	/// them directly (spec.md §3: "current effective request.url/.method
	/// MUST reflect all accumulated modifications").
	pub fn apply_modification(&mut self, delta: ModifiedRequest) {
		let entry = self.modified_request.get_or_insert_with(ModifiedRequest::default);
		entry.merge(delta);
		if let Some(url) = &entry.url {
			self.uri = url.clone();
		}
		if let Some(method) = &entry.method {
			self.method = method.clone();
		}
	}
}

/// Free-list of [`RequestContext`]s shared by the Listener/Request Engine.
pub struct ContextPool(ObjectPool<RequestContext>);

impl ContextPool {
	pub fn new(max_idle: usize) -> Self {
		Self(ObjectPool::new(max_idle, RequestContext::blank, RequestContext::reset))
	}

	pub fn acquire(&self, client_addr: std::net::SocketAddr) -> Box<RequestContext> {
		let mut ctx = self.0.acquire();
		ctx.request_id = log::next_request_id();
		ctx.span = log::connection_span(ctx.request_id, client_addr);
		ctx.start_time = Instant::now();
		ctx
	}

	pub fn release(&self, ctx: Box<RequestContext>) {
		self.0.release(ctx);
	}
}

pub type SharedContextPool = Arc<ContextPool>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn released_context_is_reset_before_reuse() {
		let pool = ContextPool::new(4);
		let mut ctx = pool.acquire("127.0.0.1:1".parse().unwrap());
		ctx.stopped = true;
		ctx.meta_bag.insert("k", "v");
		pool.release(ctx);
		let ctx = pool.acquire("127.0.0.1:1".parse().unwrap());
		assert!(!ctx.stopped);
		assert!(ctx.meta_bag.get("k").is_none());
	}

	#[test]
	fn modify_and_forward_deltas_merge_headers_later_wins() {
		let mut ctx = RequestContext::blank();
		let mut d1 = ModifiedRequest::default();
		d1.headers.insert("x-a", "1".parse().unwrap());
		d1.headers.insert("x-b", "1".parse().unwrap());
		ctx.apply_modification(d1);

		let mut d2 = ModifiedRequest::default();
		d2.headers.insert("x-b", "2".parse().unwrap());
		ctx.apply_modification(d2);

		let merged = ctx.modified_request.unwrap();
		assert_eq!(merged.headers.get("x-a").unwrap(), "1");
		assert_eq!(merged.headers.get("x-b").unwrap(), "2");
	}

	#[test]
	fn modify_and_forward_url_and_method_are_last_wins() {
		let mut ctx = RequestContext::blank();
		ctx.apply_modification(ModifiedRequest {
			url: Some(Uri::from_static("http://a.example/one")),
			method: Some(Method::GET),
			..Default::default()
		});
		ctx.apply_modification(ModifiedRequest {
			url: Some(Uri::from_static("http://a.example/two")),
			method: None,
			..Default::default()
		});
		assert_eq!(ctx.uri, Uri::from_static("http://a.example/two"));
		assert_eq!(ctx.method, Method::GET);
	}
}
