//! Typed error enums per component, composing into [`ProxyError`].

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CertError {
	#[error("root CA not loaded")]
	CaNotLoaded,
	#[error("root CA has expired")]
	CaExpired,
	#[error("certificate synthesis failed: {0}")]
	SynthesisError(String),
}

#[derive(Debug, Error, Clone)]
pub enum FakeServerError {
	#[error(transparent)]
	Cert(#[from] CertError),
	#[error("failed to bind fake server listener: {0}")]
	ListenFailed(String),
}

#[derive(Debug, Error, Clone)]
pub enum DialError {
	#[error("connection refused by {0}")]
	ConnectionRefused(String),
	#[error("connect timed out to {0}")]
	ConnectTimeout(String),
	#[error("host unreachable: {0}")]
	HostUnreachable(String),
	#[error("upstream proxy refused CONNECT: {0}")]
	UpstreamConnectRefused(StatusCode),
	#[error("SOCKS5 negotiation failed: {0}")]
	SocksNegotiation(String),
	#[error("SOCKS5 upstream requires authentication")]
	SocksAuthRequired,
	#[error("SOCKS5 upstream rejected request: code {0:#04x}")]
	SocksRejected(u8),
	#[error("upstream returned a malformed response: {0}")]
	UpstreamProtocol(String),
	#[error("io error dialing upstream: {0}")]
	Io(String),
}

impl DialError {
	pub fn from_io(target: &str, err: &std::io::Error) -> Self {
		use std::io::ErrorKind::*;
		match err.kind() {
			ConnectionRefused => DialError::ConnectionRefused(target.to_string()),
			TimedOut => DialError::ConnectTimeout(target.to_string()),
			HostUnreachable | NetworkUnreachable => DialError::HostUnreachable(target.to_string()),
			_ => DialError::Io(err.to_string()),
		}
	}

	/// Stable label for the `agent_pool.errors` metric family (spec.md §6).
	pub fn kind(&self) -> &'static str {
		match self {
			DialError::ConnectionRefused(_) => "connection_refused",
			DialError::ConnectTimeout(_) => "connect_timeout",
			DialError::HostUnreachable(_) => "host_unreachable",
			DialError::UpstreamConnectRefused(_) => "upstream_connect_refused",
			DialError::SocksNegotiation(_) => "socks_negotiation",
			DialError::SocksAuthRequired => "socks_auth_required",
			DialError::SocksRejected(_) => "socks_rejected",
			DialError::UpstreamProtocol(_) => "upstream_protocol",
			DialError::Io(_) => "io",
		}
	}
}

#[derive(Debug, Error, Clone)]
pub enum PoolError {
	#[error(transparent)]
	Dial(#[from] DialError),
	#[error("request timed out waiting on pool")]
	RequestTimeout,
}

#[derive(Debug, Error, Clone)]
pub enum PipelineError {
	#[error("stage '{0}' timed out")]
	StageTimeout(String),
	#[error("interceptor '{0}' failed: {1}")]
	InterceptorError(String, String),
	#[error("too many in-flight pipelines")]
	Overloaded,
	#[error("client disconnected mid-request")]
	ClientAborted,
}

/// Top-level error composing every component's error kind, mirroring the
/// status-code mapping in the component design.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
	#[error(transparent)]
	Cert(#[from] CertError),
	#[error(transparent)]
	FakeServer(#[from] FakeServerError),
	#[error(transparent)]
	Dial(#[from] DialError),
	#[error(transparent)]
	Pool(#[from] PoolError),
	#[error(transparent)]
	Pipeline(#[from] PipelineError),
	#[error("policy could not reach a decision, degrading to tunnel")]
	PolicyUndecidable,
}

impl ProxyError {
	/// Status code a client-facing response should carry for this error.
	/// `ClientAborted` has no response: the caller must not write one.
	pub fn status_code(&self) -> Option<StatusCode> {
		match self {
			ProxyError::Cert(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
			ProxyError::FakeServer(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
			ProxyError::Dial(DialError::ConnectionRefused(_)) => Some(StatusCode::BAD_GATEWAY),
			ProxyError::Dial(DialError::ConnectTimeout(_)) => Some(StatusCode::GATEWAY_TIMEOUT),
			ProxyError::Dial(DialError::HostUnreachable(_)) => Some(StatusCode::BAD_GATEWAY),
			ProxyError::Dial(_) => Some(StatusCode::BAD_GATEWAY),
			ProxyError::Pool(PoolError::Dial(d)) => ProxyError::Dial(d.clone()).status_code(),
			ProxyError::Pool(PoolError::RequestTimeout) => Some(StatusCode::GATEWAY_TIMEOUT),
			ProxyError::Pipeline(PipelineError::Overloaded) => Some(StatusCode::SERVICE_UNAVAILABLE),
			ProxyError::Pipeline(PipelineError::ClientAborted) => None,
			ProxyError::Pipeline(_) => None,
			ProxyError::PolicyUndecidable => None,
		}
	}

	/// Short plaintext body, never containing internal detail beyond the
	/// target description the caller supplies.
	pub fn client_message(&self) -> String {
		match self {
			ProxyError::Dial(d) => format!("upstream connect failed: {d}"),
			other => format!("proxy error: {other}"),
		}
	}
}
