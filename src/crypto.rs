//! Session-key management for sensitive literals.
//!
//! Detected secrets and PII are kept encrypted while they sit in the
//! substitution store: each session gets a 256-bit AES-GCM key with a short
//! lifetime, and both keys and plaintext copies are zeroed on cleanup. The
//! on-wire placeholder never embeds ciphertext; this is purely
//! at-rest-in-memory protection.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::GatewayError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
/// Session keys expire after ten minutes; an expired key means the
/// session's literals are unrecoverable, which is the intended failure mode.
const SESSION_KEY_LIFETIME: Duration = Duration::from_secs(600);

struct SessionKey {
    key: [u8; KEY_LEN],
    created: Instant,
}

#[derive(Default)]
pub struct SessionCrypto {
    keys: Mutex<HashMap<String, SessionKey>>,
}

impl SessionCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_key(&self, session_id: &str) -> [u8; KEY_LEN] {
        let mut keys = self.keys.lock().unwrap();
        match keys.get(session_id) {
            Some(entry) if entry.created.elapsed() < SESSION_KEY_LIFETIME => entry.key,
            _ => {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                keys.insert(
                    session_id.to_string(),
                    SessionKey {
                        key,
                        created: Instant::now(),
                    },
                );
                key
            }
        }
    }

    /// Encrypt a literal under the session key. Output is nonce ‖ ciphertext.
    pub fn encrypt(&self, plaintext: &[u8], session_id: &str) -> Result<Vec<u8>, GatewayError> {
        let key_bytes = self.session_key(session_id);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| GatewayError::Redaction(format!("encrypt: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8], session_id: &str) -> Result<Vec<u8>, GatewayError> {
        if data.len() < NONCE_LEN {
            return Err(GatewayError::Redaction("ciphertext too short".into()));
        }
        let key_bytes = {
            let keys = self.keys.lock().unwrap();
            match keys.get(session_id) {
                Some(entry) if entry.created.elapsed() < SESSION_KEY_LIFETIME => entry.key,
                _ => {
                    return Err(GatewayError::Redaction(format!(
                        "no valid session key for {session_id}"
                    )))
                }
            }
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|e| GatewayError::Redaction(format!("decrypt: {e}")))
    }

    /// Drop a session's key, zeroing it first.
    pub fn cleanup_session(&self, session_id: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(mut entry) = keys.remove(session_id) {
            wipe(&mut entry.key);
        }
    }

}

/// Overwrite sensitive bytes in place. Volatile writes so the zeroing is
/// not optimized away.
pub fn wipe(data: &mut [u8]) {
    for b in data.iter_mut() {
        unsafe { std::ptr::write_volatile(b, 0) };
    }
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
