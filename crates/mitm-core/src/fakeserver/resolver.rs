//! `rustls` SNI resolver backed by the Cert Factory (spec.md §4.2: "install
//! an SNI callback that itself uses Cert Factory, so connections for other
//! covered hostnames reuse the same server"). Grounded on the same
//! `ResolvesServerCert` shape used for dynamic per-SNI certs elsewhere in
//! the pack: `resolve` is synchronous, so cache hits are a single lock and
//! misses synthesize inline.

use std::sync::Arc;

use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;

use crate::cert::CertFactory;

pub struct FactoryResolver {
	cert_factory: Arc<CertFactory>,
	/// Hostname to use when the client hello carries no SNI at all.
	fallback_hostname: String,
}

impl FactoryResolver {
	pub fn new(cert_factory: Arc<CertFactory>, fallback_hostname: String) -> Self {
		Self { cert_factory, fallback_hostname }
	}
}

impl rustls::server::ResolvesServerCert for FactoryResolver {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		let hostname = client_hello
			.server_name()
			.map(str::to_string)
			.unwrap_or_else(|| self.fallback_hostname.clone());
		match self.cert_factory.get_cert_sync(&hostname) {
			Ok(leaf) => Some(leaf.certified_key),
			Err(err) => {
				tracing::warn!(%hostname, error = %err, "fake server cert resolution failed");
				None
			},
		}
	}
}
