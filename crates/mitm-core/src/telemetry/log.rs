//! Structured logging: one `tracing` span per request/connection, created
//! at accept time and carried on the [`crate::context::RequestContext`] for
//! correlation, the same shape as the teacher's per-request span.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::Span;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic id, unique within the process lifetime, used to correlate log
/// lines for a single request/connection.
pub fn next_request_id() -> u64 {
	NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opens the root span for one accepted connection/request. Fields are
/// filled in as they become known; `tracing`'s empty-field placeholders
/// keep the span shape stable across the request lifecycle.
pub fn connection_span(request_id: u64, client_addr: std::net::SocketAddr) -> Span {
	tracing::info_span!(
		"connection",
		request_id,
		client.addr = %client_addr,
		host = tracing::field::Empty,
		route = tracing::field::Empty,
		backend = tracing::field::Empty,
		ssl = tracing::field::Empty,
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_ids_are_monotonic_and_unique() {
		let a = next_request_id();
		let b = next_request_id();
		assert!(b > a);
	}
}
