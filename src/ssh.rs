//! SSH client configuration, host key verification policy, and the auth-method
//! selector.
//!
//! # Algorithm Preferences
//!
//! The key exchange, cipher, and MAC preference lists are fixed rather than
//! negotiated from client input: browsers never choose SSH algorithms, the
//! gateway does.
//!
//! # Host Key Verification
//!
//! [`GatewayHandler::check_server_key`] honors [`HostKeyPolicy`]. The default,
//! `AcceptAny`, accepts every host key unconditionally, mirroring
//! `StrictHostKeyChecking=no`. This is a documented weakness: it accepts
//! man-in-the-middle risk in exchange for never blocking a first connection on
//! an unknown host. `Tofu` instead pins the first key seen per host and
//! rejects any later key that doesn't match.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use russh::Preferred;
use russh::keys::PublicKey;
use russh::{client, keys};
use tracing::{debug, warn};

use crate::config::HostKeyPolicy;

/// Key exchange algorithms offered to the remote host, strongest first.
pub const KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group14-sha256",
];

/// Symmetric ciphers offered to the remote host, strongest first.
pub const CIPHERS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-ctr",
    "aes192-ctr",
    "aes128-ctr",
];

/// MAC algorithms offered, used only for ciphers without built-in AEAD tags.
pub const MACS: &[&str] = &["hmac-sha2-256-etm@openssh.com", "hmac-sha2-512-etm@openssh.com"];

/// Host key algorithms the gateway will accept from the server.
pub const HOST_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ecdsa-sha2-nistp256",
];

/// Compression algorithms offered, compression disabled by default.
pub const COMPRESSION_ALGORITHMS: &[&str] = &["none", "zlib@openssh.com"];

/// Turns the algorithm preference lists above into the typed negotiation
/// preferences `russh` actually negotiates with, in the same order.
fn negotiation_preferences() -> Preferred {
    let kex = KEX_ALGORITHMS
        .iter()
        .filter_map(|name| russh::kex::Name::try_from(*name).ok())
        .collect::<Vec<_>>();
    let cipher = CIPHERS
        .iter()
        .filter_map(|name| russh::cipher::Name::try_from(*name).ok())
        .collect::<Vec<_>>();
    let mac = MACS
        .iter()
        .filter_map(|name| russh::mac::Name::try_from(*name).ok())
        .collect::<Vec<_>>();
    let key = HOST_KEY_ALGORITHMS
        .iter()
        .filter_map(|name| keys::Algorithm::new(name).ok())
        .collect::<Vec<_>>();
    let compression = COMPRESSION_ALGORITHMS
        .iter()
        .filter_map(|name| russh::compression::Name::try_from(*name).ok())
        .collect::<Vec<_>>();

    Preferred {
        kex: Cow::Owned(kex),
        key: Cow::Owned(key),
        cipher: Cow::Owned(cipher),
        mac: Cow::Owned(mac),
        compression: Cow::Owned(compression),
    }
}

/// Builds the `russh` client configuration shared by every connection.
///
/// Timeouts are driven by the orchestrator's own watchdog, so `inactivity_timeout`
/// is left unset here; the keepalive cadence matches §6 (10s interval, 3 missed
/// before the connection is declared dead).
pub fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(crate::config::resolve_keepalive_interval_secs(None))),
        keepalive_max: crate::config::resolve_keepalive_max(None) as usize,
        preferred: negotiation_preferences(),
        ..Default::default()
    })
}

/// Splits a `host:port` address into its components, defaulting to port 22.
///
/// Uses `rsplit_once` so IPv6 literals such as `[::1]:22` split on the last
/// colon rather than the first.
pub fn parse_address(address: &str) -> Result<(String, u16), String> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| format!("invalid port number: {e}"))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

/// `russh::client::Handler` implementing the configured host key policy.
pub struct GatewayHandler {
    policy: HostKeyPolicy,
    host: String,
    known_hosts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl GatewayHandler {
    pub fn new(
        policy: HostKeyPolicy,
        host: String,
        known_hosts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    ) -> Self {
        Self {
            policy,
            host,
            known_hosts,
        }
    }
}

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => {
                debug!(host = %self.host, "accepting host key without verification");
                Ok(true)
            }
            HostKeyPolicy::Tofu => {
                let fingerprint = server_public_key.to_bytes().map_err(russh::Error::from)?;
                let mut known = self.known_hosts.lock().expect("known_hosts poisoned");
                match known.get(&self.host) {
                    Some(pinned) if pinned == &fingerprint => Ok(true),
                    Some(_) => {
                        warn!(host = %self.host, "host key changed, rejecting (trust-on-first-use)");
                        Ok(false)
                    }
                    None => {
                        known.insert(self.host.clone(), fingerprint);
                        debug!(host = %self.host, "pinning host key (trust-on-first-use)");
                        Ok(true)
                    }
                }
            }
        }
    }
}

/// Which SSH authentication method succeeded, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey,
    KeyboardInteractive,
    Password,
}

/// Tries publickey, then keyboard-interactive (with empty responses), then
/// password, in that order, returning the first method that succeeds.
///
/// This mirrors the priority the design mandates: publickey is attempted
/// whenever a key is supplied, keyboard-interactive is probed next since many
/// servers require it even without interactive input, and password is the
/// last resort.
pub async fn authenticate(
    handle: &mut client::Handle<GatewayHandler>,
    username: &str,
    private_key_pem: &str,
    passphrase: Option<&str>,
) -> Result<AuthMethod, String> {
    let key_pair = keys::decode_secret_key(private_key_pem, passphrase)
        .map_err(|e| format!("failed to parse private key: {e}"))?;

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();

    let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

    let result = handle
        .authenticate_publickey(username, key_with_hash)
        .await
        .map_err(|e| format!("publickey authentication failed: {e}"))?;

    if result.success() {
        return Ok(AuthMethod::PublicKey);
    }

    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None)
        .await
        .map_err(|e| format!("keyboard-interactive authentication failed: {e}"))?;

    // Respond with empty strings for every prompt: the private key is the
    // intended credential, keyboard-interactive is only probed because some
    // servers require it regardless.
    loop {
        match response {
            client::KeyboardInteractiveAuthResponse::Success => return Ok(AuthMethod::KeyboardInteractive),
            client::KeyboardInteractiveAuthResponse::Failure { .. } => break,
            client::KeyboardInteractiveAuthResponse::InfoRequest { ref prompts, .. } => {
                let responses = vec![String::new(); prompts.len()];
                response = handle
                    .authenticate_keyboard_interactive_respond(responses)
                    .await
                    .map_err(|e| format!("keyboard-interactive authentication failed: {e}"))?;
            }
        }
    }

    Err("all authentication methods failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_with_port() {
        let (host, port) = parse_address("example.com:2222").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 2222);
    }

    #[test]
    fn test_parse_address_default_port() {
        let (host, port) = parse_address("192.168.1.1").unwrap();
        assert_eq!(host, "192.168.1.1");
        assert_eq!(port, 22);
    }

    #[test]
    fn test_parse_address_ipv6() {
        let (host, port) = parse_address("[::1]:22").unwrap();
        assert_eq!(host, "[::1]");
        assert_eq!(port, 22);
    }

    #[test]
    fn test_parse_address_invalid_port() {
        assert!(parse_address("host:notaport").is_err());
    }

    #[test]
    fn test_algorithm_lists_nonempty() {
        assert!(!KEX_ALGORITHMS.is_empty());
        assert!(!CIPHERS.is_empty());
        assert!(!HOST_KEY_ALGORITHMS.is_empty());
    }

    #[test]
    fn test_negotiation_preferences_wires_every_list() {
        let preferred = negotiation_preferences();
        assert_eq!(preferred.kex.len(), KEX_ALGORITHMS.len());
        assert_eq!(preferred.cipher.len(), CIPHERS.len());
        assert_eq!(preferred.mac.len(), MACS.len());
        assert_eq!(preferred.key.len(), HOST_KEY_ALGORITHMS.len());
        assert_eq!(preferred.compression.len(), COMPRESSION_ALGORITHMS.len());
    }

    #[test]
    fn test_build_client_config_uses_configured_preferences() {
        let config = build_client_config();
        assert_eq!(config.preferred.kex.len(), KEX_ALGORITHMS.len());
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(10)));
    }
}
