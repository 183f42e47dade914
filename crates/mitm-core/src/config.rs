//! Typed configuration consumed by the core. Loading it from a file or CLI
//! flags is an external collaborator's job (non-goal); the core only ever
//! sees an already-populated [`Config`].

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_cert_cache_capacity() -> usize {
	1000
}
fn default_cert_ttl() -> Duration {
	Duration::from_secs(24 * 3600)
}
fn default_fake_server_capacity() -> usize {
	100
}
fn default_pool_max_in_use() -> usize {
	256
}
fn default_pool_max_idle() -> usize {
	256
}
fn default_idle_ttl() -> Duration {
	Duration::from_secs(30)
}
fn default_pool_cleanup_interval() -> Duration {
	Duration::from_secs(60)
}
fn default_request_timeout() -> Duration {
	Duration::from_secs(60)
}
fn default_connect_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_stage_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_max_concurrent_pipelines() -> usize {
	50
}
fn default_listen_port() -> u16 {
	8080
}

/// Tunables for the certificate cache (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertFactoryConfig {
	pub cache_capacity: usize,
	#[serde(with = "humantime_duration")]
	pub cache_ttl: Duration,
}

impl Default for CertFactoryConfig {
	fn default() -> Self {
		Self {
			cache_capacity: default_cert_cache_capacity(),
			cache_ttl: default_cert_ttl(),
		}
	}
}

/// Tunables for the fake-server pool (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeServerConfig {
	pub capacity: usize,
}

impl Default for FakeServerConfig {
	fn default() -> Self {
		Self {
			capacity: default_fake_server_capacity(),
		}
	}
}

/// Tunables for the agent (upstream connection) pool (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPoolConfig {
	pub max_in_use_per_origin: usize,
	pub max_idle_per_origin: usize,
	#[serde(with = "humantime_duration")]
	pub idle_ttl: Duration,
	#[serde(with = "humantime_duration")]
	pub cleanup_interval: Duration,
	#[serde(with = "humantime_duration")]
	pub request_timeout: Duration,
}

impl Default for AgentPoolConfig {
	fn default() -> Self {
		Self {
			max_in_use_per_origin: default_pool_max_in_use(),
			max_idle_per_origin: default_pool_max_idle(),
			idle_ttl: default_idle_ttl(),
			cleanup_interval: default_pool_cleanup_interval(),
			request_timeout: default_request_timeout(),
		}
	}
}

/// Which upstream proxy (if any) the dialer should use to reach origins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamProxyConfig {
	Direct,
	Http {
		host: String,
		port: u16,
		username: Option<String>,
		password: Option<String>,
	},
	Socks5 {
		host: String,
		port: u16,
		username: Option<String>,
		password: Option<String>,
	},
}

impl Default for UpstreamProxyConfig {
	fn default() -> Self {
		UpstreamProxyConfig::Direct
	}
}

/// Tunables for the upstream dialer (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
	pub upstream_proxy: UpstreamProxyConfig,
	#[serde(with = "humantime_duration")]
	pub connect_timeout: Duration,
	pub validate_upstream_certs: bool,
}

impl Default for DialerConfig {
	fn default() -> Self {
		Self {
			upstream_proxy: UpstreamProxyConfig::Direct,
			connect_timeout: default_connect_timeout(),
			validate_upstream_certs: true,
		}
	}
}

/// Sets that drive the interception decision (spec §4.5 / §3 Interception
/// Policy Record). Immutable once the listener starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptionPolicyConfig {
	pub domains: HashSet<String>,
	pub urls: HashSet<String>,
	pub url_prefixes: HashSet<String>,
	pub path_prefixes: HashSet<String>,
	pub fast_domains: HashSet<String>,
	pub static_extensions: HashSet<String>,
}

impl Default for InterceptionPolicyConfig {
	fn default() -> Self {
		Self {
			domains: HashSet::new(),
			urls: HashSet::new(),
			url_prefixes: HashSet::new(),
			path_prefixes: HashSet::new(),
			fast_domains: HashSet::new(),
			static_extensions: HashSet::new(),
		}
	}
}

/// Tunables for the middleware/interceptor pipeline (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
	#[serde(with = "humantime_duration")]
	pub stage_timeout: Duration,
	pub max_concurrent: usize,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			stage_timeout: default_stage_timeout(),
			max_concurrent: default_max_concurrent_pipelines(),
		}
	}
}

/// Root configuration the core accepts; a collaborator is responsible for
/// producing one from a file/CLI (non-goal of the core itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub listen_port: u16,
	pub proxy_agent_name: String,
	pub cert_factory: CertFactoryConfig,
	pub fake_server: FakeServerConfig,
	pub agent_pool: AgentPoolConfig,
	pub dialer: DialerConfig,
	pub policy: InterceptionPolicyConfig,
	pub pipeline: PipelineConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen_port: default_listen_port(),
			proxy_agent_name: "mitm-proxy".to_string(),
			cert_factory: CertFactoryConfig::default(),
			fake_server: FakeServerConfig::default(),
			agent_pool: AgentPoolConfig::default(),
			dialer: DialerConfig::default(),
			policy: InterceptionPolicyConfig::default(),
			pipeline: PipelineConfig::default(),
		}
	}
}

mod humantime_duration {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let secs = u64::deserialize(d)?;
		Ok(Duration::from_secs(secs))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_round_trips_through_yaml() {
		let cfg = Config::default();
		let yaml = serde_yaml::to_string(&cfg).unwrap();
		let back: Config = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(back.listen_port, cfg.listen_port);
		assert_eq!(back.cert_factory.cache_capacity, 1000);
		assert_eq!(back.agent_pool.max_in_use_per_origin, 256);
	}

	#[test]
	fn partial_yaml_fills_defaults() {
		let cfg: Config = serde_yaml::from_str("listen_port: 9090\n").unwrap();
		assert_eq!(cfg.listen_port, 9090);
		assert_eq!(cfg.fake_server.capacity, 100);
	}
}
