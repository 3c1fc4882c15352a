//! Host and user keys: loading, wire blobs, signatures and host
//! fingerprints.
//!
//! ```no_run
//! let key = sshconn::keys::load_secret_key("tests/fixtures/id_rsa").unwrap();
//! let fingerprint = sshconn::keys::fingerprint(
//!     sshconn::keys::HostHash::Md5,
//!     key.public_key(),
//! ).unwrap();
//! println!("{fingerprint}");
//! ```

use std::path::Path;

use data_encoding::{BASE64, HEXLOWER};
use log::debug;
use sha2::Digest as _;
use ssh_encoding::Decode;
pub use ssh_key::{Algorithm, HashAlg, PrivateKey, PublicKey, Signature};

use crate::helpers::EncodedExt;
use crate::Error;

/// Load an unencrypted private key in the OpenSSH format.
pub fn load_secret_key<P: AsRef<Path>>(path: P) -> Result<PrivateKey, Error> {
    let secret = std::fs::read_to_string(path)?;
    Ok(PrivateKey::from_openssh(secret)?)
}

/// Load a public key from a file in the `authorized_keys` format.
pub fn load_public_key<P: AsRef<Path>>(path: P) -> Result<PublicKey, Error> {
    let public = std::fs::read_to_string(path)?;
    Ok(PublicKey::from_openssh(public.trim())?)
}

/// Reads a public key from the base64 part of the standard encoding,
/// such as the second field of `ssh-ed25519 AAAAC3N...`.
pub fn parse_public_key_base64(key: &str) -> Result<PublicKey, Error> {
    let blob = BASE64
        .decode(key.trim().as_bytes())
        .map_err(|_| Error::UnknownKey)?;
    parse_public_key(&blob)
}

/// Parses a public key blob as sent on the wire.
pub fn parse_public_key(blob: &[u8]) -> Result<PublicKey, Error> {
    Ok(PublicKey::from_bytes(blob)?)
}

/// The wire encoding of a public key, as embedded in authentication
/// requests and used for fingerprints.
pub fn public_key_blob(key: &PublicKey) -> Result<Vec<u8>, Error> {
    Ok(key.key_data().encoded()?)
}

/// The algorithm tag of a key, e.g. `ssh-rsa`, `ssh-dss` or `ssh-ed25519`.
pub fn algorithm_tag(key: &PublicKey) -> String {
    key.algorithm().as_str().to_string()
}

/// The algorithm a signature made with `key` carries: `rsa-sha2-512`
/// for RSA keys ([RFC 8332](https://tools.ietf.org/html/rfc8332)), the
/// key's own algorithm otherwise.
pub fn signature_algorithm(key: &PublicKey) -> String {
    match key.algorithm() {
        Algorithm::Rsa { .. } => Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        }
        .as_str()
        .to_string(),
        algorithm => algorithm.as_str().to_string(),
    }
}

/// Signs `data` and returns the encoded signature (algorithm name
/// followed by the signature bytes). Fails if the signer would not use
/// `algorithm`.
pub fn sign(key: &PrivateKey, algorithm: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    let signature: Signature = signature::Signer::try_sign(key, data)?;
    if signature.algorithm().as_str() != algorithm {
        debug!(
            "signer used {:?} instead of {:?}",
            signature.algorithm().as_str(),
            algorithm
        );
        return Err(signature::Error::new().into());
    }
    Ok(signature.encoded()?)
}

/// Checks an encoded signature over `data`, made with `algorithm`.
/// Malformed signatures, and signatures of another algorithm, are
/// reported as not matching.
pub fn verify(key: &PublicKey, algorithm: &str, data: &[u8], signature: &[u8]) -> bool {
    let mut r = signature;
    let Ok(signature) = Signature::decode(&mut r) else {
        return false;
    };
    if signature.algorithm().as_str() != algorithm {
        return false;
    }
    signature::Verifier::verify(key, data, &signature).is_ok()
}

/// Digest used to present a host key to a verification hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHash {
    Md5,
    Sha1,
    Sha256,
}

/// Lowercase hex digest of the public key blob.
pub fn fingerprint(hash: HostHash, key: &PublicKey) -> Result<String, Error> {
    let blob = public_key_blob(key)?;
    Ok(match hash {
        HostHash::Md5 => HEXLOWER.encode(&md5::compute(&blob).0),
        HostHash::Sha1 => HEXLOWER.encode(&sha1::Sha1::digest(&blob)),
        HostHash::Sha256 => HEXLOWER.encode(&sha2::Sha256::digest(&blob)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_ED25519_PUB: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIE6owW1d/M27jcjC4mdH1mG3";

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    #[test]
    fn host_fingerprints() {
        let key = load_public_key(fixture("host_ed25519.pub")).unwrap();
        assert_eq!(
            fingerprint(HostHash::Md5, &key).unwrap(),
            "f4ca5adf25ca348276ca0459cd4a4d9e"
        );
        assert_eq!(
            fingerprint(HostHash::Sha256, &key).unwrap(),
            "6acded3f657bb269d9400d3aa53b0258cc8146d202707670ee9140931af2dfea"
        );
        assert_eq!(fingerprint(HostHash::Sha1, &key).unwrap().len(), 40);
    }

    #[test]
    fn blob_round_trip_and_tags() {
        let key = load_public_key(fixture("host_ed25519.pub")).unwrap();
        let blob = public_key_blob(&key).unwrap();
        assert!(BASE64.encode(&blob).starts_with(HOST_ED25519_PUB));
        assert_eq!(parse_public_key(&blob).unwrap().key_data(), key.key_data());
        assert_eq!(algorithm_tag(&key), "ssh-ed25519");

        let rsa = load_public_key(fixture("id_rsa.pub")).unwrap();
        assert_eq!(algorithm_tag(&rsa), "ssh-rsa");
        let dsa = load_public_key(fixture("id_dsa.pub")).unwrap();
        assert_eq!(algorithm_tag(&dsa), "ssh-dss");
    }

    #[test]
    fn signatures_verify_only_with_the_right_key() {
        let key = load_secret_key(fixture("id_rsa")).unwrap();
        let other = load_secret_key(fixture("host_ed25519")).unwrap();
        let algorithm = signature_algorithm(key.public_key());
        let sig = sign(&key, &algorithm, b"session data").unwrap();
        assert!(verify(key.public_key(), &algorithm, b"session data", &sig));
        assert!(!verify(key.public_key(), &algorithm, b"other data", &sig));
        assert!(!verify(other.public_key(), &algorithm, b"session data", &sig));
        assert!(!verify(key.public_key(), &algorithm, b"session data", b"garbage"));
        assert!(!verify(key.public_key(), "ssh-rsa", b"session data", &sig));
    }

    #[test]
    fn rsa_signatures_carry_the_announced_algorithm() {
        let rsa = load_secret_key(fixture("id_rsa")).unwrap();
        let algorithm = signature_algorithm(rsa.public_key());
        assert_eq!(algorithm, "rsa-sha2-512");
        let sig = sign(&rsa, &algorithm, b"session data").unwrap();
        let decoded = Signature::decode(&mut &sig[..]).unwrap();
        assert_eq!(decoded.algorithm().as_str(), algorithm);

        let dsa = load_secret_key(fixture("id_dsa")).unwrap();
        assert_eq!(signature_algorithm(dsa.public_key()), "ssh-dss");
        let ed25519 = load_secret_key(fixture("host_ed25519")).unwrap();
        assert_eq!(signature_algorithm(ed25519.public_key()), "ssh-ed25519");

        assert!(sign(&rsa, "ssh-rsa", b"session data").is_err());
    }
}
