//! Upstream Dialer (spec.md §4.4): opens a raw byte stream to an origin,
//! directly or via an HTTP-CONNECT or SOCKS5 upstream proxy.

mod socks5;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::{DialerConfig, UpstreamProxyConfig};
use crate::error::DialError;
use crate::pool::OriginKey;

/// A dial target, independent of whether TLS should be layered on top by
/// the caller (the Agent Pool dials plaintext sockets for `http://`
/// origins and TLS sockets for `https://` origins).
pub struct DialTarget<'a> {
	pub host: &'a str,
	pub port: u16,
	pub tls: bool,
}

/// Type-erased upstream socket. Boxed so the Agent Pool's idle deque does
/// not need to be generic over the concrete TCP/TLS stream type.
pub enum UpstreamStream {
	Boxed(Pin<Box<dyn AsyncReadWrite>>),
	Closed,
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

impl UpstreamStream {
	pub fn new(inner: impl AsyncReadWrite + 'static) -> Self {
		UpstreamStream::Boxed(Box::pin(inner))
	}

	pub fn closed() -> Self {
		UpstreamStream::Closed
	}
}

impl AsyncRead for UpstreamStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			UpstreamStream::Boxed(s) => s.as_mut().poll_read(cx, buf),
			UpstreamStream::Closed => Poll::Ready(Ok(())),
		}
	}
}

impl AsyncWrite for UpstreamStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			UpstreamStream::Boxed(s) => s.as_mut().poll_write(cx, buf),
			UpstreamStream::Closed => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			UpstreamStream::Boxed(s) => s.as_mut().poll_flush(cx),
			UpstreamStream::Closed => Poll::Ready(Ok(())),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			UpstreamStream::Boxed(s) => s.as_mut().poll_shutdown(cx),
			UpstreamStream::Closed => Poll::Ready(Ok(())),
		}
	}
}

pub struct Dialer {
	config: DialerConfig,
	tls_connector: TlsConnector,
}

impl Dialer {
	pub fn new(config: DialerConfig) -> Self {
		// spec.md §4.4: skip validation only when explicitly configured.
		// An empty root store plus the normal verifier (the old code path)
		// rejects every certificate, which is the opposite of "skip".
		let tls_config = if config.validate_upstream_certs {
			let mut roots = rustls::RootCertStore::empty();
			for cert in rustls_native_certs::load_native_certs().certs {
				let _ = roots.add(cert);
			}
			rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
		} else {
			rustls::ClientConfig::builder()
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(NoVerifier))
				.with_no_client_auth()
		};
		Self { config, tls_connector: TlsConnector::from(Arc::new(tls_config)) }
	}

	/// Dials `origin`, applying whichever upstream-proxy mode is
	/// configured. `origin.scheme == "https"` layers a TLS handshake on
	/// top of the raw stream once it's established.
	pub async fn dial(&self, origin: &OriginKey) -> Result<UpstreamStream, DialError> {
		let target = DialTarget { host: &origin.host, port: origin.port, tls: origin.scheme.eq_ignore_ascii_case("https") };
		let raw = self.dial_raw(target.host, target.port).await?;
		if target.tls {
			self.upgrade_tls(raw, target.host).await
		} else {
			Ok(raw)
		}
	}

	async fn dial_raw(&self, host: &str, port: u16) -> Result<UpstreamStream, DialError> {
		match self.config.upstream_proxy.clone() {
			UpstreamProxyConfig::Direct => self.dial_direct(host, port).await,
			UpstreamProxyConfig::Http { host: proxy_host, port: proxy_port, username, password } => {
				self.dial_via_http_connect(&proxy_host, proxy_port, host, port, username, password).await
			},
			UpstreamProxyConfig::Socks5 { host: proxy_host, port: proxy_port, username, password } => {
				self.dial_via_socks5(&proxy_host, proxy_port, host, port, username, password).await
			},
		}
	}

	async fn dial_direct(&self, host: &str, port: u16) -> Result<UpstreamStream, DialError> {
		let addr = format!("{host}:{port}");
		let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
			.await
			.map_err(|_| DialError::ConnectTimeout(addr.clone()))?
			.map_err(|e| DialError::from_io(&addr, &e))?;
		Ok(UpstreamStream::new(stream))
	}

	async fn upgrade_tls(&self, stream: UpstreamStream, host: &str) -> Result<UpstreamStream, DialError> {
		let UpstreamStream::Boxed(inner) = stream else {
			return Err(DialError::Io("cannot TLS-upgrade a closed stream".to_string()));
		};
		let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
			.map_err(|e| DialError::Io(e.to_string()))?;
		let tls = self
			.tls_connector
			.connect(server_name, TokioIoAdapter(inner))
			.await
			.map_err(|e| DialError::Io(e.to_string()))?;
		Ok(UpstreamStream::new(tls))
	}

	/// HTTP-CONNECT upstream mode (spec.md §4.4).
	async fn dial_via_http_connect(
		&self,
		proxy_host: &str,
		proxy_port: u16,
		target_host: &str,
		target_port: u16,
		username: Option<String>,
		password: Option<String>,
	) -> Result<UpstreamStream, DialError> {
		let mut stream = self.dial_direct(proxy_host, proxy_port).await?;
		let mut request = format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n");
		if let (Some(user), Some(pass)) = (username, password) {
			let creds = BASE64.encode(format!("{user}:{pass}"));
			request.push_str(&format!("Proxy-Authorization: Basic {creds}\r\n"));
		}
		request.push_str("\r\n");
		stream.write_all(request.as_bytes()).await.map_err(|e| DialError::from_io(proxy_host, &e))?;

		let mut buf = Vec::with_capacity(512);
		let mut byte = [0u8; 1];
		loop {
			stream.read_exact(&mut byte).await.map_err(|e| DialError::from_io(proxy_host, &e))?;
			buf.push(byte[0]);
			if buf.ends_with(b"\r\n\r\n") {
				break;
			}
			if buf.len() > 8192 {
				return Err(DialError::UpstreamProtocol("CONNECT response headers too large".to_string()));
			}
		}
		let status_line = String::from_utf8_lossy(&buf);
		let status_line = status_line.lines().next().unwrap_or_default();
		let status: http::StatusCode = status_line
			.split_whitespace()
			.nth(1)
			.and_then(|s| s.parse::<u16>().ok())
			.and_then(|code| http::StatusCode::from_u16(code).ok())
			.ok_or_else(|| DialError::UpstreamProtocol(format!("malformed CONNECT response: {status_line}")))?;
		if !status.is_success() {
			return Err(DialError::UpstreamConnectRefused(status));
		}
		Ok(stream)
	}

	async fn dial_via_socks5(
		&self,
		proxy_host: &str,
		proxy_port: u16,
		target_host: &str,
		target_port: u16,
		username: Option<String>,
		password: Option<String>,
	) -> Result<UpstreamStream, DialError> {
		let stream = self.dial_direct(proxy_host, proxy_port).await?;
		socks5::negotiate(stream, target_host, target_port, username, password).await
	}
}

/// Accepts every upstream certificate unconditionally. Installed only when
/// `validate_upstream_certs` is explicitly set to `false` (spec.md §4.4).
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(&self, _message: &[u8], _cert: &CertificateDer<'_>, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(&self, _message: &[u8], _cert: &CertificateDer<'_>, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms.supported_schemes()
	}
}

/// Adapts our boxed `AsyncReadWrite` trait object to the concrete,
/// `Unpin`-bound type `tokio_rustls::TlsConnector::connect` expects.
struct TokioIoAdapter(Pin<Box<dyn AsyncReadWrite>>);

impl AsyncRead for TokioIoAdapter {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		self.0.as_mut().poll_read(cx, buf)
	}
}

impl AsyncWrite for TokioIoAdapter {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		self.0.as_mut().poll_write(cx, buf)
	}
	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.0.as_mut().poll_flush(cx)
	}
	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.0.as_mut().poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_dialer_uses_direct_mode() {
		let config = DialerConfig::default();
		assert!(matches!(config.upstream_proxy, UpstreamProxyConfig::Direct));
	}

	#[tokio::test]
	async fn direct_dial_to_closed_port_fails_fast() {
		let dialer = Dialer::new(DialerConfig { connect_timeout: Duration::from_millis(200), ..Default::default() });
		let origin = OriginKey::new("http", "127.0.0.1", 1);
		let result = dialer.dial(&origin).await;
		assert!(result.is_err());
	}
}
