//! MySQL authentication plugin responses
//!
//! Implements the client side of the three plugins the broker speaks:
//! - `mysql_native_password`: SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
//! - `caching_sha2_password`: SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble),
//!   with RSA-OAEP full authentication when the channel is not secure
//! - `mysql_clear_password`: the password itself, NUL-terminated

use crate::error::Error;
use crate::protocol::constants::auth_plugins;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Authentication plugin error types
#[derive(Debug, Clone)]
pub enum PluginError {
    /// Server asked for a plugin the client does not implement or allow
    Unsupported(String),
    /// Server sent an unusable RSA public key
    InvalidPublicKey(String),
    /// RSA encryption failed
    Encryption(String),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::Unsupported(name) => write!(f, "unsupported auth plugin: {}", name),
            PluginError::InvalidPublicKey(msg) => write!(f, "invalid server public key: {}", msg),
            PluginError::Encryption(msg) => write!(f, "RSA encryption failed: {}", msg),
        }
    }
}

impl std::error::Error for PluginError {}

impl From<PluginError> for Error {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Unsupported(_) => Error::Config(err.to_string()),
            _ => Error::Protocol(err.to_string()),
        }
    }
}

/// Which plugins the client is willing to answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginPolicy {
    /// `mysql_clear_password` allowed (cleartext mode, IAM and AAD tokens)
    pub allow_cleartext: bool,
    /// `mysql_native_password` allowed (native mode)
    pub allow_native: bool,
}

impl PluginPolicy {
    /// Check that `plugin` may be used under this policy
    pub fn check(&self, plugin: &str) -> Result<(), PluginError> {
        match plugin {
            auth_plugins::CACHING_SHA2_PASSWORD => Ok(()),
            auth_plugins::MYSQL_NATIVE_PASSWORD if self.allow_native => Ok(()),
            auth_plugins::MYSQL_CLEAR_PASSWORD if self.allow_cleartext => Ok(()),
            other => Err(PluginError::Unsupported(other.to_string())),
        }
    }
}

/// Compute the initial auth response for `plugin`
pub fn auth_response(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>, PluginError> {
    match plugin {
        auth_plugins::MYSQL_NATIVE_PASSWORD => Ok(scramble_native(password, scramble)),
        auth_plugins::CACHING_SHA2_PASSWORD => Ok(scramble_caching_sha2(password, scramble)),
        auth_plugins::MYSQL_CLEAR_PASSWORD => Ok(cleartext(password)),
        other => Err(PluginError::Unsupported(other.to_string())),
    }
}

/// `mysql_native_password` scramble
pub fn scramble_native(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(nonce(scramble));
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    xor(&stage1, &stage3)
}

/// `caching_sha2_password` fast-auth scramble
pub fn scramble_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce(scramble));
    let stage3 = hasher.finalize();

    xor(&stage1, &stage3)
}

/// `mysql_clear_password` response
pub fn cleartext(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Encrypt the password for `caching_sha2_password` full auth over an insecure channel
///
/// `pem` is the server public key as sent in the "more data" packet, either
/// SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`).
pub fn encrypt_password(password: &str, scramble: &[u8], pem: &[u8]) -> Result<Vec<u8>, PluginError> {
    let pem = std::str::from_utf8(pem)
        .map_err(|e| PluginError::InvalidPublicKey(e.to_string()))?
        .trim_end_matches('\0')
        .trim();

    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| PluginError::InvalidPublicKey(e.to_string()))?;

    let nonce = nonce(scramble);
    if nonce.is_empty() {
        return Err(PluginError::Encryption("empty scramble".into()));
    }
    let mut plain = cleartext(password);
    for (i, byte) in plain.iter_mut().enumerate() {
        *byte ^= nonce[i % nonce.len()];
    }

    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, Oaep::new::<Sha1>(), &plain)
        .map_err(|e| PluginError::Encryption(e.to_string()))
}

/// Scramble without the trailing NUL some servers append
fn nonce(scramble: &[u8]) -> &[u8] {
    scramble.strip_suffix(&[0]).unwrap_or(scramble)
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    const SCRAMBLE: &[u8] = b"abcdefghijklmnopqrst";

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_native_scramble_known_answer() {
        let out = scramble_native("secret", SCRAMBLE);
        assert_eq!(hex(&out), "8817c50fa779daef010ee7577825b0847df9842e");
    }

    #[test]
    fn test_caching_sha2_scramble_known_answer() {
        let out = scramble_caching_sha2("secret", SCRAMBLE);
        assert_eq!(
            hex(&out),
            "c76e2898612a4cf042c77fa8c4702c4c64c0c2c557c53c4d75595aaa6abae809"
        );
    }

    #[test]
    fn test_trailing_nul_in_scramble_is_ignored() {
        let mut with_nul = SCRAMBLE.to_vec();
        with_nul.push(0);
        assert_eq!(
            scramble_native("secret", &with_nul),
            scramble_native("secret", SCRAMBLE)
        );
    }

    #[test]
    fn test_empty_password_sends_empty_response() {
        assert!(scramble_native("", SCRAMBLE).is_empty());
        assert!(scramble_caching_sha2("", SCRAMBLE).is_empty());
        assert_eq!(cleartext(""), vec![0]);
    }

    #[test]
    fn test_policy_gates_plugins() {
        let strict = PluginPolicy {
            allow_cleartext: false,
            allow_native: false,
        };
        assert!(strict.check(auth_plugins::CACHING_SHA2_PASSWORD).is_ok());
        assert!(strict.check(auth_plugins::MYSQL_NATIVE_PASSWORD).is_err());
        assert!(strict.check(auth_plugins::MYSQL_CLEAR_PASSWORD).is_err());
        assert!(strict.check("sha256_password").is_err());

        let iam = PluginPolicy {
            allow_cleartext: true,
            allow_native: false,
        };
        assert!(iam.check(auth_plugins::MYSQL_CLEAR_PASSWORD).is_ok());
    }

    #[test]
    fn test_unsupported_plugin_is_config_error() {
        let err: Error = auth_response("dialog", "pw", SCRAMBLE).unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rsa_full_auth_roundtrip() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let encrypted = encrypt_password("hunter2", SCRAMBLE, pem.as_bytes()).unwrap();
        let decrypted = private.decrypt(Oaep::new::<Sha1>(), &encrypted).unwrap();
        let recovered: Vec<u8> = decrypted
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ SCRAMBLE[i % SCRAMBLE.len()])
            .collect();
        assert_eq!(recovered, b"hunter2\0");
    }

    #[test]
    fn test_rsa_rejects_garbage_key() {
        let err = encrypt_password("pw", SCRAMBLE, b"not a key").unwrap_err();
        assert!(matches!(err, PluginError::InvalidPublicKey(_)));
    }
}
