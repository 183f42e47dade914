//! Per-hostname leaf certificate factory (spec.md §4.1): mint-or-cache a
//! leaf cert signed by the root CA, with bounded capacity, TTL, at-most-
//! one-synthesis-per-hostname coalescing, and an optional pinned
//! "fixed cert" mode.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proxy_core::SingleFlight;
use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, SanType};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;

use crate::cert::ca::RootCa;
use crate::error::CertError;
use crate::telemetry::Metrics;

/// A pinned `{cert, key}` pair bypassing synthesis entirely (spec.md §4.1
/// "fixed-cert mode"), supplied either globally or as a per-request
/// override (precedence resolved in SPEC_FULL.md: context > global > dynamic).
#[derive(Clone)]
pub struct FixedCert {
	pub cert_der: CertificateDer<'static>,
	pub key_der: Vec<u8>,
}

/// Cached or pinned leaf, as described in spec.md §3.
#[derive(Clone)]
pub struct LeafCertEntry {
	pub cert_pem: String,
	pub key_pem: String,
	pub not_after: time::OffsetDateTime,
	pub san_set: Vec<String>,
	pub created_at: Instant,
	pub certified_key: Arc<CertifiedKey>,
}

struct CacheEntry {
	leaf: LeafCertEntry,
}

pub struct CertFactory {
	ca: Arc<RootCa>,
	cache: Mutex<HashMap<String, CacheEntry>>,
	inflight: SingleFlight<String, LeafCertEntry, CertError>,
	capacity: usize,
	ttl: Duration,
	provider: Arc<CryptoProvider>,
	fixed: Option<FixedCert>,
	metrics: Arc<Metrics>,
}

fn normalize_hostname(hostname: &str) -> String {
	hostname.trim().to_ascii_lowercase()
}

/// SAN set per spec.md §3: the hostname itself, plus the wildcard of the
/// parent domain for multi-label non-IP hosts, plus an IP SAN when the
/// hostname parses as an IP address.
fn compute_sans(hostname: &str) -> Vec<String> {
	if let Ok(ip) = hostname.parse::<IpAddr>() {
		return vec![ip.to_string()];
	}
	let mut sans = vec![hostname.to_string()];
	let labels: Vec<&str> = hostname.split('.').collect();
	if labels.len() >= 2 {
		sans.push(format!("*.{}", labels[1..].join(".")));
	}
	sans
}

fn san_types(hostname: &str, sans: &[String]) -> Result<Vec<SanType>, CertError> {
	sans
		.iter()
		.map(|s| {
			if let Ok(ip) = s.parse::<IpAddr>() {
				Ok(SanType::IpAddress(ip))
			} else {
				Ia5String::try_from(s.as_str())
					.map(SanType::DnsName)
					.map_err(|e| CertError::SynthesisError(format!("invalid SAN {hostname}: {e}")))
			}
		})
		.collect()
}

fn unique_serial() -> rcgen::SerialNumber {
	let mut bytes = [0u8; 16];
	rand::rng().fill_bytes(&mut bytes);
	rcgen::SerialNumber::from_slice(&bytes)
}

impl CertFactory {
	pub fn new(
		ca: Arc<RootCa>,
		capacity: usize,
		ttl: Duration,
		fixed: Option<FixedCert>,
		metrics: Arc<Metrics>,
	) -> Result<Self, CertError> {
		let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
		Ok(Self {
			ca,
			cache: Mutex::new(HashMap::new()),
			inflight: SingleFlight::new(),
			capacity,
			ttl,
			provider,
			fixed,
			metrics,
		})
	}

	/// `get_cert` per spec.md §4.1. `context_fixed` is the per-request
	/// pinned override, which outranks the factory-wide fixed cert, which
	/// in turn outranks dynamic synthesis.
	pub async fn get_cert(
		&self,
		hostname: &str,
		context_fixed: Option<&FixedCert>,
	) -> Result<LeafCertEntry, CertError> {
		if self.ca.is_expired() {
			return Err(CertError::CaExpired);
		}

		if let Some(fixed) = context_fixed.or(self.fixed.as_ref()) {
			return self.pinned_entry(fixed);
		}

		let hostname = normalize_hostname(hostname);
		if let Some(entry) = self.cache_lookup(&hostname) {
			self.metrics.cert_factory.cache_hits.inc();
			return Ok(entry);
		}

		let ca = self.ca.clone();
		let provider = self.provider.clone();
		let metrics = self.metrics.clone();
		let key = hostname.clone();
		let leaf = self
			.inflight
			.get_or_try_init(hostname.clone(), move || async move {
				synthesize_leaf(&ca, &provider, &key, &metrics)
			})
			.await?;

		self.insert(hostname, leaf.clone());
		Ok(leaf)
	}

	/// Synchronous counterpart used from inside `rustls`'s
	/// `ResolvesServerCert::resolve`, which is not an async fn (spec.md
	/// §4.2: "install an SNI callback that itself uses Cert Factory").
	/// Cache hits resolve with just a lock; misses synthesize inline —
	/// concurrent misses for a brand-new hostname may race into a
	/// duplicate (but harmless) keygen rather than coalescing, which is
	/// acceptable here since the async `get_cert` path already guarantees
	/// coalescing for the common "first CONNECT" case.
	pub fn get_cert_sync(&self, hostname: &str) -> Result<LeafCertEntry, CertError> {
		if self.ca.is_expired() {
			return Err(CertError::CaExpired);
		}
		if let Some(fixed) = &self.fixed {
			return self.pinned_entry(fixed);
		}
		let hostname = normalize_hostname(hostname);
		if let Some(entry) = self.cache_lookup(&hostname) {
			self.metrics.cert_factory.cache_hits.inc();
			return Ok(entry);
		}
		let leaf = synthesize_leaf(&self.ca, &self.provider, &hostname, &self.metrics)?;
		self.insert(hostname, leaf.clone());
		Ok(leaf)
	}

	fn cache_lookup(&self, hostname: &str) -> Option<LeafCertEntry> {
		let cache = self.cache.lock();
		let entry = cache.get(hostname)?;
		if entry.leaf.created_at.elapsed() > self.ttl {
			return None;
		}
		Some(entry.leaf.clone())
	}

	fn insert(&self, hostname: String, leaf: LeafCertEntry) {
		let mut cache = self.cache.lock();
		if cache.len() >= self.capacity && !cache.contains_key(&hostname) {
			if let Some(oldest_key) = cache
				.iter()
				.min_by_key(|(_, e)| e.leaf.created_at)
				.map(|(k, _)| k.clone())
			{
				cache.remove(&oldest_key);
				self.metrics.cert_factory.evictions.inc();
			}
		}
		cache.insert(hostname, CacheEntry { leaf });
	}

	fn pinned_entry(&self, fixed: &FixedCert) -> Result<LeafCertEntry, CertError> {
		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(fixed.key_der.clone()));
		let signing_key = self
			.provider
			.key_provider
			.load_private_key(key_der)
			.map_err(|e| CertError::SynthesisError(e.to_string()))?;
		let certified_key = Arc::new(CertifiedKey::new(vec![fixed.cert_der.clone()], signing_key));
		Ok(LeafCertEntry {
			cert_pem: String::new(),
			key_pem: String::new(),
			not_after: time::OffsetDateTime::now_utc() + time::Duration::days(365 * 10),
			san_set: Vec::new(),
			created_at: Instant::now(),
			certified_key,
		})
	}
}

fn synthesize_leaf(
	ca: &RootCa,
	provider: &Arc<CryptoProvider>,
	hostname: &str,
	metrics: &Metrics,
) -> Result<LeafCertEntry, CertError> {
	let sans = compute_sans(hostname);
	let san_types = san_types(hostname, &sans)?;

	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, hostname);

	let now = time::OffsetDateTime::now_utc();
	let not_after = now + time::Duration::days(365);

	let mut params = CertificateParams::default();
	params.distinguished_name = dn;
	params.not_before = now - time::Duration::hours(1);
	params.not_after = not_after;
	params.subject_alt_names = san_types;
	params.serial_number = Some(unique_serial());
	params.is_ca = rcgen::IsCa::NoCa;
	params.key_usages = vec![
		rcgen::KeyUsagePurpose::KeyEncipherment,
		rcgen::KeyUsagePurpose::DigitalSignature,
	];
	params.extended_key_usages = vec![
		rcgen::ExtendedKeyUsagePurpose::ServerAuth,
		rcgen::ExtendedKeyUsagePurpose::ClientAuth,
	];

	let leaf_key = crate::cert::generate_rsa_keypair()?;
	let issuer = ca.issuer();
	let cert = params
		.signed_by(&leaf_key, &issuer)
		.map_err(|e| CertError::SynthesisError(e.to_string()))?;

	let cert_pem = cert.pem();
	let key_pem = leaf_key.serialize_pem();

	let cert_der = cert.der().clone();
	let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
	let signing_key = provider
		.key_provider
		.load_private_key(key_der)
		.map_err(|e| CertError::SynthesisError(e.to_string()))?;
	let certified_key = Arc::new(CertifiedKey::new(vec![cert_der], signing_key));

	metrics.cert_factory.synthesized.inc();

	Ok(LeafCertEntry {
		cert_pem,
		key_pem,
		not_after,
		san_set: sans,
		created_at: Instant::now(),
		certified_key,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn factory() -> CertFactory {
		let ca = Arc::new(RootCa::generate("test CA").unwrap());
		CertFactory::new(ca, 1000, Duration::from_secs(3600), None, Arc::new(Metrics::new())).unwrap()
	}

	#[test]
	fn sans_include_wildcard_for_multi_label_hosts() {
		let sans = compute_sans("a.b.example.com");
		assert!(sans.contains(&"a.b.example.com".to_string()));
		assert!(sans.contains(&"*.b.example.com".to_string()));
	}

	#[test]
	fn sans_for_ip_host_is_ip_only() {
		let sans = compute_sans("127.0.0.1");
		assert_eq!(sans, vec!["127.0.0.1".to_string()]);
	}

	#[tokio::test]
	async fn repeated_get_cert_within_ttl_is_byte_identical() {
		let f = factory();
		let a = f.get_cert("example.com", None).await.unwrap();
		let b = f.get_cert("example.com", None).await.unwrap();
		assert_eq!(a.cert_pem, b.cert_pem);
		assert_eq!(a.key_pem, b.key_pem);
	}

	#[tokio::test]
	async fn san_set_contains_hostname_and_wildcard() {
		let f = factory();
		let leaf = f.get_cert("a.example.com", None).await.unwrap();
		assert!(leaf.san_set.contains(&"a.example.com".to_string()));
		assert!(leaf.san_set.contains(&"*.example.com".to_string()));
	}

	#[tokio::test]
	async fn concurrent_requests_for_same_host_synthesize_once() {
		let f = Arc::new(factory());
		let mut handles = Vec::new();
		for _ in 0..8 {
			let f = f.clone();
			handles.push(tokio::spawn(
				async move { f.get_cert("concurrent.example.com", None).await.unwrap() },
			));
		}
		let mut results = Vec::new();
		for h in handles {
			results.push(h.await.unwrap());
		}
		assert!(results.windows(2).all(|w| w[0].cert_pem == w[1].cert_pem));
		assert_eq!(f.metrics.cert_factory.synthesized.get(), 1);
	}

	#[tokio::test]
	async fn eviction_removes_oldest_created_entry() {
		let f = factory();
		{
			let mut cache = f.cache.lock();
			for i in 0..1000 {
				let mut leaf = synthesize_leaf(&f.ca, &f.provider, &format!("h{i}.example.com"), &f.metrics).unwrap();
				leaf.created_at = Instant::now() - Duration::from_secs(1000 - i as u64);
				cache.insert(format!("h{i}.example.com"), CacheEntry { leaf });
			}
		}
		f.get_cert("new-host.example.com", None).await.unwrap();
		let cache = f.cache.lock();
		assert!(!cache.contains_key("h0.example.com"));
		assert!(cache.contains_key("new-host.example.com"));
	}
}
