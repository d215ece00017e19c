//! Secret payload decoding and age key generation.
//!
//! SSH secrets carry `ssh-privatekey` (required), `ssh-password` and
//! `known_hosts` (optional). Basic-auth secrets carry `username` and
//! `password`, both required. Encryption secrets hold the age identity
//! under `SOPS_AGE_KEY`.

use std::collections::BTreeMap;

use age::secrecy::ExposeSecret as _;
use git::GitAuth;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use secrecy::SecretString;
use thiserror::Error;

pub const SSH_PRIVATE_KEY: &str = "ssh-privatekey";
pub const SSH_PASSWORD: &str = "ssh-password";
pub const KNOWN_HOSTS: &str = "known_hosts";
pub const BASIC_USERNAME: &str = "username";
pub const BASIC_PASSWORD: &str = "password";
pub const SOPS_AGE_KEY: &str = "SOPS_AGE_KEY";

pub const RECIPIENT_ANNOTATION: &str = "gitmirror.dev/age-recipient";
pub const BACKUP_WARNING_ANNOTATION: &str = "gitmirror.dev/backup-warning";
pub const BACKUP_WARNING: &str =
    "This key was generated by gitmirror and exists only here. Back it up before relying on \
     encrypted content; losing it makes the repository unreadable.";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret key {0} is not valid UTF-8")]
    NotUtf8(&'static str),
    #[error("secret carries neither {SSH_PRIVATE_KEY} nor {BASIC_USERNAME}/{BASIC_PASSWORD}")]
    NoRecognizedKeys,
    #[error("secret has {BASIC_USERNAME} but no {BASIC_PASSWORD}")]
    IncompleteBasicAuth,
    #[error("secret is missing the {SOPS_AGE_KEY} key")]
    MissingAgeKey,
}

fn utf8(data: &BTreeMap<String, ByteString>, key: &'static str) -> Result<Option<String>, SecretError> {
    match data.get(key) {
        Some(bytes) => String::from_utf8(bytes.0.clone())
            .map(Some)
            .map_err(|_| SecretError::NotUtf8(key)),
        None => Ok(None),
    }
}

/// Decode transport credentials from a provider secret. SSH wins when both
/// shapes are present.
pub fn git_auth_from_secret(secret: &Secret) -> Result<GitAuth, SecretError> {
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);
    if let Some(private_key) = utf8(data, SSH_PRIVATE_KEY)? {
        return Ok(GitAuth::Ssh {
            private_key: SecretString::from(private_key),
            passphrase: utf8(data, SSH_PASSWORD)?.map(SecretString::from),
            known_hosts: utf8(data, KNOWN_HOSTS)?,
        });
    }
    match (utf8(data, BASIC_USERNAME)?, utf8(data, BASIC_PASSWORD)?) {
        (Some(username), Some(password)) => Ok(GitAuth::Basic {
            username,
            password: SecretString::from(password),
        }),
        (Some(_), None) | (None, Some(_)) => Err(SecretError::IncompleteBasicAuth),
        (None, None) => Err(SecretError::NoRecognizedKeys),
    }
}

/// Check an encryption secret for the age identity.
pub fn validate_age_secret(secret: &Secret) -> Result<(), SecretError> {
    let has_key = secret
        .data
        .as_ref()
        .is_some_and(|data| data.contains_key(SOPS_AGE_KEY))
        || secret
            .string_data
            .as_ref()
            .is_some_and(|data| data.contains_key(SOPS_AGE_KEY));
    if has_key { Ok(()) } else { Err(SecretError::MissingAgeKey) }
}

/// A freshly generated age key pair: the identity goes into the secret,
/// the recipient into an annotation on it.
pub struct GeneratedAgeKey {
    pub identity: SecretString,
    pub recipient: String,
}

pub fn generate_age_key() -> GeneratedAgeKey {
    let identity = age::x25519::Identity::generate();
    let recipient = identity.to_public().to_string();
    GeneratedAgeKey {
        identity: SecretString::from(identity.to_string().expose_secret().to_string()),
        recipient,
    }
}
