//! Interception Policy (spec.md §4.5): classifies a request as *intercept*
//! (run the pipeline, terminate TLS) or *tunnel* (opaque bypass).

use crate::config::InterceptionPolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	Tunnel,
	Intercept,
}

/// Process-wide, immutable once the listener starts (spec.md §3).
pub struct InterceptionPolicy {
	config: InterceptionPolicyConfig,
}

impl InterceptionPolicy {
	pub fn new(config: InterceptionPolicyConfig) -> Self {
		Self { config }
	}

	/// Algorithm from spec.md §4.5, evaluated in order; first conclusive
	/// result wins. `path` is `None` for a CONNECT request (no path
	/// available, per spec.md §4.8).
	pub fn evaluate(&self, hostname: &str, url: &str, path: Option<&str>) -> Disposition {
		let hostname = hostname.trim_end_matches('.');

		if self.config.fast_domains.iter().any(|d| domain_matches(d, hostname)) {
			return Disposition::Tunnel;
		}

		if let Some(path) = path {
			if let Some(ext) = extension_of(path) {
				if self.config.static_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
					return Disposition::Tunnel;
				}
			}
		}

		if self.config.domains.is_empty()
			&& self.config.urls.is_empty()
			&& self.config.url_prefixes.is_empty()
			&& self.config.path_prefixes.is_empty()
		{
			return Disposition::Tunnel;
		}

		let host_matches = self.config.domains.iter().any(|d| domain_matches(d, hostname));
		let path_or_url_matches = path.is_some_and(|p| self.config.path_prefixes.iter().any(|pfx| p.starts_with(pfx.as_str())))
			|| self.config.url_prefixes.iter().any(|pfx| url.starts_with(pfx.as_str()))
			|| self.config.urls.contains(url);

		if host_matches && path_or_url_matches {
			Disposition::Intercept
		} else {
			Disposition::Tunnel
		}
	}
}

/// A configured domain matches either exactly or as a parent of `hostname`
/// (e.g. configuring `example.com` also covers `api.example.com`).
fn domain_matches(configured: &str, hostname: &str) -> bool {
	hostname == configured || hostname.ends_with(&format!(".{configured}"))
}

fn extension_of(path: &str) -> Option<String> {
	let last_segment = path.rsplit('/').next().unwrap_or(path);
	last_segment.rsplit_once('.').map(|(_, ext)| ext.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	fn config() -> InterceptionPolicyConfig {
		InterceptionPolicyConfig {
			domains: HashSet::from(["httpbin.org".to_string()]),
			urls: HashSet::new(),
			url_prefixes: HashSet::new(),
			path_prefixes: HashSet::from(["/headers".to_string()]),
			fast_domains: HashSet::from(["fast.example.com".to_string()]),
			static_extensions: HashSet::from(["png".to_string(), "jpg".to_string()]),
		}
	}

	#[test]
	fn fast_domains_always_tunnel() {
		let policy = InterceptionPolicy::new(config());
		assert_eq!(
			policy.evaluate("fast.example.com", "https://fast.example.com/headers", Some("/headers")),
			Disposition::Tunnel
		);
	}

	#[test]
	fn static_extensions_tunnel() {
		let policy = InterceptionPolicy::new(config());
		assert_eq!(
			policy.evaluate("httpbin.org", "https://httpbin.org/img.png", Some("/img.png")),
			Disposition::Tunnel
		);
	}

	#[test]
	fn empty_policy_tunnels_everything() {
		let policy = InterceptionPolicy::new(InterceptionPolicyConfig::default());
		assert_eq!(policy.evaluate("example.com", "https://example.com/", Some("/")), Disposition::Tunnel);
	}

	#[test]
	fn matching_domain_and_path_prefix_intercepts() {
		let policy = InterceptionPolicy::new(config());
		assert_eq!(
			policy.evaluate("httpbin.org", "https://httpbin.org/headers", Some("/headers")),
			Disposition::Intercept
		);
	}

	#[test]
	fn matching_domain_without_path_or_url_match_tunnels() {
		let policy = InterceptionPolicy::new(config());
		assert_eq!(
			policy.evaluate("httpbin.org", "https://httpbin.org/other", Some("/other")),
			Disposition::Tunnel
		);
	}

	#[test]
	fn connect_requests_have_no_path() {
		let policy = InterceptionPolicy::new(config());
		assert_eq!(policy.evaluate("httpbin.org", "httpbin.org:443", None), Disposition::Tunnel);
	}
}
