//! Thin binary wiring: load configuration, load or generate the root CA,
//! and hand both to [`mitm_core::Proxy`]. Writing interceptors is an
//! embedding-application concern (spec.md §1's non-goal), so this binary
//! starts with an empty pipeline stage list — real deployments link their
//! own `PipelineStage` implementations in here.

#[cfg(all(feature = "jemalloc", target_os = "linux"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use mitm_core::cert::RootCa;
use mitm_core::config::Config;

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy", about = "Interception-capable HTTP/HTTPS/WebSocket forward proxy")]
struct Args {
	/// Path to a YAML config file (spec.md §5); flags below override it.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Overrides the listening port from the config file.
	#[arg(long)]
	listen_port: Option<u16>,

	/// Root CA certificate, PEM-encoded. Generated alongside `--ca-key` on
	/// first run if either file is missing.
	#[arg(long, default_value = "ca-cert.pem")]
	ca_cert: PathBuf,

	/// Root CA private key, PEM-encoded (PKCS#8).
	#[arg(long, default_value = "ca-key.pem")]
	ca_key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("mitm_proxy=info".parse()?).add_directive("mitm_core=info".parse()?))
		.init();

	let args = Args::parse();

	let mut config = match &args.config {
		Some(path) => {
			let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
			serde_yaml::from_str::<Config>(&raw).with_context(|| format!("parsing config file {}", path.display()))?
		},
		None => Config::default(),
	};
	if let Some(port) = args.listen_port {
		config.listen_port = port;
	}

	let listen_port = config.listen_port;
	let root_ca = load_or_generate_ca(&args.ca_cert, &args.ca_key)?;

	let proxy = mitm_core::Proxy::new(config, root_ca, None, Vec::new()).context("building proxy")?;

	tracing::info!(port = listen_port, "mitm-proxy starting");
	proxy.run().await.context("listener failed")?;
	Ok(())
}

/// Loads the root CA from `cert_path`/`key_path` if both exist, else
/// generates a fresh one and persists it there (spec.md §6's on-first-run
/// path) so subsequent runs reuse the same CA identity.
fn load_or_generate_ca(cert_path: &PathBuf, key_path: &PathBuf) -> Result<RootCa> {
	if cert_path.exists() && key_path.exists() {
		let cert_pem = std::fs::read(cert_path).with_context(|| format!("reading {}", cert_path.display()))?;
		let key_pem = std::fs::read(key_path).with_context(|| format!("reading {}", key_path.display()))?;
		let cert_der = parse_cert_der(&cert_pem)?;
		let key_pair = rcgen::KeyPair::from_pem(std::str::from_utf8(&key_pem).context("CA key file is not valid UTF-8 PEM")?).context("parsing CA private key")?;
		tracing::info!(cert = %cert_path.display(), "loaded existing root CA");
		return RootCa::from_parsed(cert_der, key_pair).map_err(|e| anyhow!(e));
	}

	tracing::info!(cert = %cert_path.display(), key = %key_path.display(), "no root CA found on disk, generating a fresh one");
	let ca = RootCa::generate("mitm-proxy root CA").map_err(|e| anyhow!(e))?;
	let (cert_pem, key_pem) = ca.to_pem();
	std::fs::write(cert_path, cert_pem).with_context(|| format!("writing {}", cert_path.display()))?;
	std::fs::write(key_path, key_pem).with_context(|| format!("writing {}", key_path.display()))?;
	Ok(ca)
}

fn parse_cert_der(pem: &[u8]) -> Result<rcgen::CertificateDer<'static>> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let item = rustls_pemfile::read_one(&mut reader).context("parsing CA certificate PEM")?.ok_or_else(|| anyhow!("CA certificate file contains no PEM block"))?;
	match item {
		rustls_pemfile::Item::X509Certificate(der) => Ok(der),
		_ => Err(anyhow!("CA certificate file does not contain an X.509 certificate")),
	}
}
