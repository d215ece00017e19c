use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use git2::{CertificateCheckStatus, Cred, RemoteCallbacks};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

/// Transport credentials for one provider, decoded from its secret.
#[derive(Clone, Default)]
pub enum GitAuth {
    /// Anonymous (public https remotes, local test remotes).
    #[default]
    Anonymous,
    Ssh {
        private_key: SecretString,
        passphrase: Option<SecretString>,
        /// OpenSSH known_hosts content; when present, the remote host key
        /// must appear in it.
        known_hosts: Option<String>,
    },
    Basic {
        username: String,
        password: SecretString,
    },
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitAuth::Anonymous => f.write_str("GitAuth::Anonymous"),
            GitAuth::Ssh { known_hosts, .. } => f
                .debug_struct("GitAuth::Ssh")
                .field("known_hosts", &known_hosts.is_some())
                .finish_non_exhaustive(),
            GitAuth::Basic { username, .. } => f
                .debug_struct("GitAuth::Basic")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl GitAuth {
    /// Remote callbacks wired for this credential set.
    pub fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        match self {
            GitAuth::Anonymous => {}
            GitAuth::Ssh {
                private_key,
                passphrase,
                known_hosts,
            } => {
                callbacks.credentials(move |_url, username_from_url, _allowed| {
                    Cred::ssh_key_from_memory(
                        username_from_url.unwrap_or("git"),
                        None,
                        private_key.expose_secret(),
                        passphrase.as_ref().map(|p| p.expose_secret()),
                    )
                });
                let known_hosts = known_hosts.clone();
                callbacks.certificate_check(move |cert, host| {
                    match &known_hosts {
                        Some(entries) => {
                            let hostkey = cert.as_hostkey().and_then(|k| k.hostkey());
                            match hostkey {
                                Some(key) if known_hosts_contains(entries, host, key) => {
                                    Ok(CertificateCheckStatus::CertificateOk)
                                }
                                _ => Err(git2::Error::from_str(&format!(
                                    "host key for {host} not present in known_hosts"
                                ))),
                            }
                        }
                        None => {
                            warn!(%host, "no known_hosts configured, accepting host key");
                            Ok(CertificateCheckStatus::CertificateOk)
                        }
                    }
                });
            }
            GitAuth::Basic { username, password } => {
                callbacks.credentials(move |_url, _username_from_url, _allowed| {
                    Cred::userpass_plaintext(username, password.expose_secret())
                });
            }
        }
        callbacks
    }
}

/// Match the raw host key against the base64 key blobs of known_hosts
/// entries for this host.
fn known_hosts_contains(entries: &str, host: &str, key: &[u8]) -> bool {
    let encoded = BASE64.encode(key);
    entries
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| {
            let mut fields = line.split_whitespace();
            let hosts = fields.next().unwrap_or_default();
            let _keytype = fields.next();
            let blob = fields.next().unwrap_or_default();
            hosts.split(',').any(|h| h == host || h.trim_start_matches('[').starts_with(host))
                && blob == encoded
        })
}
