//! SOCKS5 upstream negotiation (RFC 1928, optional RFC 1929 auth), per
//! spec.md §4.4.

use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::UpstreamStream;
use crate::error::DialError;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Per SPEC_FULL.md's resolved open question: offer user/pass auth (`02`)
/// only when both username and password are non-empty; otherwise offer
/// only no-auth (`00`).
pub async fn negotiate(
	mut stream: UpstreamStream,
	target_host: &str,
	target_port: u16,
	username: Option<String>,
	password: Option<String>,
) -> Result<UpstreamStream, DialError> {
	let creds = match (username, password) {
		(Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
		_ => None,
	};

	let methods: &[u8] = if creds.is_some() { &[METHOD_NO_AUTH, METHOD_USER_PASS] } else { &[METHOD_NO_AUTH] };
	let mut greeting = vec![VERSION, methods.len() as u8];
	greeting.extend_from_slice(methods);
	stream.write_all(&greeting).await.map_err(io_err)?;

	let mut resp = [0u8; 2];
	stream.read_exact(&mut resp).await.map_err(io_err)?;
	if resp[0] != VERSION {
		return Err(DialError::SocksNegotiation(format!("unexpected version {:#04x}", resp[0])));
	}
	match resp[1] {
		METHOD_NO_AUTH => {},
		METHOD_USER_PASS => {
			let (user, pass) = creds.ok_or(DialError::SocksAuthRequired)?;
			let mut auth = vec![0x01u8, user.len() as u8];
			auth.extend_from_slice(user.as_bytes());
			auth.push(pass.len() as u8);
			auth.extend_from_slice(pass.as_bytes());
			stream.write_all(&auth).await.map_err(io_err)?;
			let mut auth_resp = [0u8; 2];
			stream.read_exact(&mut auth_resp).await.map_err(io_err)?;
			if auth_resp[1] != 0x00 {
				return Err(DialError::SocksAuthRequired);
			}
		},
		0xFF => return Err(DialError::SocksAuthRequired),
		other => return Err(DialError::SocksNegotiation(format!("no acceptable method, server chose {other:#04x}"))),
	}

	let mut request = vec![VERSION, CMD_CONNECT, 0x00];
	if let Ok(ip) = target_host.parse::<IpAddr>() {
		match ip {
			IpAddr::V4(v4) => {
				request.push(ATYP_IPV4);
				request.extend_from_slice(&v4.octets());
			},
			IpAddr::V6(v6) => {
				request.push(ATYP_IPV6);
				request.extend_from_slice(&v6.octets());
			},
		}
	} else {
		request.push(ATYP_DOMAIN);
		request.push(target_host.len() as u8);
		request.extend_from_slice(target_host.as_bytes());
	}
	request.extend_from_slice(&target_port.to_be_bytes());
	stream.write_all(&request).await.map_err(io_err)?;

	let mut header = [0u8; 4];
	stream.read_exact(&mut header).await.map_err(io_err)?;
	if header[0] != VERSION {
		return Err(DialError::SocksNegotiation(format!("unexpected reply version {:#04x}", header[0])));
	}
	if header[1] != 0x00 {
		return Err(DialError::SocksRejected(header[1]));
	}
	let addr_len = match header[3] {
		ATYP_IPV4 => 4,
		ATYP_IPV6 => 16,
		ATYP_DOMAIN => {
			let mut len_byte = [0u8; 1];
			stream.read_exact(&mut len_byte).await.map_err(io_err)?;
			len_byte[0] as usize
		},
		other => return Err(DialError::SocksNegotiation(format!("unknown ATYP {other:#04x}"))),
	};
	let mut bound_addr = vec![0u8; addr_len + 2];
	stream.read_exact(&mut bound_addr).await.map_err(io_err)?;

	Ok(stream)
}

fn io_err(e: std::io::Error) -> DialError {
	DialError::SocksNegotiation(e.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn negotiation_against_closed_stream_fails_cleanly() {
		let stream = UpstreamStream::closed();
		let result = negotiate(stream, "api.example", 443, None, None).await;
		assert!(result.is_err());
	}
}
