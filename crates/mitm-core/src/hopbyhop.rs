//! Centralized hop-by-hop header stripping (spec.md §9 Design Notes: "make
//! the exact list explicit and centralized").

use http::{HeaderMap, HeaderName};

/// Headers meaningful only for a single transport hop and never forwarded.
pub const HOP_BY_HOP: &[HeaderName] = &[
	http::header::CONNECTION,
	HeaderName::from_static("keep-alive"),
	http::header::PROXY_AUTHENTICATE,
	http::header::PROXY_AUTHORIZATION,
	http::header::TE,
	http::header::TRAILER,
	http::header::TRANSFER_ENCODING,
	http::header::UPGRADE,
];

/// Removes the fixed hop-by-hop headers plus any header named in the
/// request's own `Connection` header (RFC 7230 §6.1), in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let extra: Vec<HeaderName> = headers
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|tok| HeaderName::from_bytes(tok.trim().as_bytes()).ok())
		.collect();

	for name in HOP_BY_HOP.iter().chain(extra.iter()) {
		headers.remove(name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	#[test]
	fn strips_fixed_hop_by_hop_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
		headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
		headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));
		strip_hop_by_hop(&mut headers);
		assert!(!headers.contains_key(http::header::CONNECTION));
		assert!(!headers.contains_key(http::header::TRANSFER_ENCODING));
		assert!(headers.contains_key(http::header::HOST));
	}

	#[test]
	fn strips_headers_named_in_connection_header() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("x-custom-hop"));
		headers.insert(
			HeaderName::from_static("x-custom-hop"),
			HeaderValue::from_static("1"),
		);
		headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));
		strip_hop_by_hop(&mut headers);
		assert!(!headers.contains_key("x-custom-hop"));
		assert!(headers.contains_key(http::header::HOST));
	}
}
