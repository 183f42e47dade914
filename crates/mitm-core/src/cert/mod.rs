pub mod ca;
pub mod factory;

pub use ca::RootCa;
pub use factory::{CertFactory, FixedCert, LeafCertEntry};

use rsa::pkcs8::EncodePrivateKey;

use crate::error::CertError;

/// Generates a 2048-bit RSA key pair for `rcgen` to sign with (spec.md §4.1
/// / §6: "RSA 2048, sha256 signature"). `rcgen`'s own `KeyPair::generate`
/// only covers ECDSA/Ed25519, so the PKCS#8 DER is produced by the `rsa`
/// crate and handed to `rcgen` as an external key.
pub(crate) fn generate_rsa_keypair() -> Result<rcgen::KeyPair, CertError> {
	let private_key =
		rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 2048).map_err(|e| CertError::SynthesisError(e.to_string()))?;
	let pkcs8 = private_key
		.to_pkcs8_der()
		.map_err(|e| CertError::SynthesisError(e.to_string()))?;
	let pkcs8_der = rustls_pki_types::PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
	rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_der, &rcgen::PKCS_RSA_SHA256)
		.map_err(|e| CertError::SynthesisError(e.to_string()))
}
