//! Challenge/response authentication
//!
//! Firmware 6.45 and later refuse every command until the client proves it
//! holds the vendor key: `get_verify_str` hands out a challenge, the client
//! signs it with RSA PKCS#1 v1.5 over SHA-1 and answers with
//! `verify_client {sign, data}`.

use crate::client::Inner;
use crate::error::{SeestarError, SeestarResult};
use crate::protocol::{methods, DeviceMessage};
use crate::PRIVATE_KEY_ENV;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde_json::json;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Key file looked up in the working directory when nothing else is configured
pub const DEFAULT_KEY_FILE: &str = "seestar_private_key.pem";

/// Resolve the key path: explicit value, then the environment, then the default file
pub fn resolve_key_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(PRIVATE_KEY_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_KEY_FILE),
    }
}

/// Load a PEM private key (PKCS#1 or PKCS#8)
pub fn load_private_key(path: &Path) -> SeestarResult<RsaPrivateKey> {
    let pem = match std::fs::read_to_string(path) {
        Ok(pem) => pem,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!("Seestar private key not found at {}", path.display());
            return Err(SeestarError::KeyNotFound {
                path: path.to_path_buf(),
                env_var: PRIVATE_KEY_ENV.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let key = RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|e| SeestarError::InvalidKey(format!("{}: {}", path.display(), e)))?;

    tracing::debug!("Loaded Seestar private key from {}", path.display());
    Ok(key)
}

/// Sign a challenge string, returning the base64 signature
pub fn sign_challenge(key: &RsaPrivateKey, challenge: &str) -> SeestarResult<String> {
    let digest = Sha1::digest(challenge.as_bytes());
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| SeestarError::InvalidKey(e.to_string()))?;
    Ok(STANDARD.encode(signature))
}

fn challenge_from(response: &DeviceMessage) -> SeestarResult<String> {
    response
        .result()
        .get("str")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SeestarError::AuthenticationFailed(format!(
                "No challenge string in response: {}",
                response.raw()
            ))
        })
}

/// Run the two-step handshake on a freshly opened connection
pub(crate) async fn authenticate(inner: &Inner, key: &RsaPrivateKey) -> SeestarResult<()> {
    tracing::info!("Requesting authentication challenge...");
    let challenge_response = inner
        .send_command(methods::GET_VERIFY_STR, None, None)
        .await
        .map_err(|e| SeestarError::AuthenticationFailed(e.to_string()))?;
    let challenge = challenge_from(&challenge_response)?;
    tracing::debug!("Received challenge: {}", challenge);

    tracing::info!("Signing challenge and authenticating...");
    let params = json!({
        "sign": sign_challenge(key, &challenge)?,
        "data": challenge,
    });
    let verify = inner
        .send_command(methods::VERIFY_CLIENT, Some(params), None)
        .await
        .map_err(|e| SeestarError::AuthenticationFailed(e.to_string()))?;

    let code = verify.result_code().unwrap_or_else(|| verify.code());
    if code != 0 {
        return Err(SeestarError::AuthenticationFailed(format!(
            "{} (code {})",
            verify
                .error_message()
                .unwrap_or_else(|| "unknown error".to_string()),
            code
        )));
    }

    tracing::info!("Authentication successful");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_key;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPublicKey;
    use std::io::Write;

    #[test]
    fn test_resolve_explicit_path_wins() {
        let explicit = PathBuf::from("/opt/keys/scope.pem");
        assert_eq!(resolve_key_path(Some(&explicit)), explicit);
    }

    #[test]
    fn test_missing_key_names_path_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pem");
        match load_private_key(&path) {
            Err(SeestarError::KeyNotFound { path: p, env_var }) => {
                assert_eq!(p, path);
                assert_eq!(env_var, PRIVATE_KEY_ENV);
            }
            Err(other) => panic!("expected KeyNotFound, got {other:?}"),
            Ok(_) => panic!("expected KeyNotFound, got a key"),
        }
    }

    #[test]
    fn test_loads_pkcs1_and_pkcs8() {
        let key = test_key();

        let mut pkcs1 = tempfile::NamedTempFile::new().unwrap();
        pkcs1
            .write_all(key.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes())
            .unwrap();
        let loaded = load_private_key(pkcs1.path()).unwrap();
        assert_eq!(RsaPublicKey::from(&loaded), RsaPublicKey::from(key));

        let mut pkcs8 = tempfile::NamedTempFile::new().unwrap();
        pkcs8
            .write_all(key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes())
            .unwrap();
        let loaded = load_private_key(pkcs8.path()).unwrap();
        assert_eq!(RsaPublicKey::from(&loaded), RsaPublicKey::from(key));
    }

    #[test]
    fn test_garbage_key_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"-----BEGIN NOTHING-----\nabc\n-----END NOTHING-----\n")
            .unwrap();
        assert!(matches!(
            load_private_key(file.path()),
            Err(SeestarError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_signature_verifies_with_public_key() {
        let key = test_key();
        let signature = sign_challenge(key, "a1b2c3d4").unwrap();
        let raw = STANDARD.decode(signature).unwrap();

        let public = RsaPublicKey::from(key);
        let digest = Sha1::digest(b"a1b2c3d4");
        assert!(public.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &raw).is_ok());

        let other = Sha1::digest(b"tampered");
        assert!(public.verify(Pkcs1v15Sign::new::<Sha1>(), &other, &raw).is_err());
    }

    #[test]
    fn test_challenge_extraction() {
        let ok = DeviceMessage::new(json!({"id": 1, "result": {"str": "xyz"}}));
        assert_eq!(challenge_from(&ok).unwrap(), "xyz");
        let empty = DeviceMessage::new(json!({"id": 1, "result": {"str": ""}}));
        assert!(matches!(
            challenge_from(&empty),
            Err(SeestarError::AuthenticationFailed(_))
        ));
    }
}
