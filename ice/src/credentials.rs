#[cfg(test)]
mod credentials_test;

use std::collections::HashMap;
use std::sync::Mutex as SyncMutex;

use stun::integrity::MessageIntegrity;

/// Derives a short-term credentials key: the (SASL-prepared) password itself.
#[must_use]
pub fn short_term_key(password: &str) -> Vec<u8> {
    MessageIntegrity::new_short_term_integrity(password.to_owned()).0
}

/// Derives a long-term credentials key: `MD5(username:realm:password)`.
#[must_use]
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    MessageIntegrity::new_long_term_integrity(
        username.to_owned(),
        realm.to_owned(),
        password.to_owned(),
    )
    .0
}

/// Answers username lookups the static tables don't cover — e.g. a TURN-style
/// long-term authenticator backed by an external user database. Consulted
/// only after the static tables miss.
pub trait CredentialAuthority: Send + Sync {
    fn local_key(&self, username: &str) -> Option<Vec<u8>>;
    fn remote_key(&self, username: &str, media: &str) -> Option<Vec<u8>>;
}

#[derive(Default)]
struct Tables {
    local: HashMap<String, Vec<u8>>,
    remote: HashMap<(String, String), Vec<u8>>,
}

/// Per-stack store of `{username -> local_key}` and
/// `{(username, media) -> remote_key}`, backed by short-term ICE ufrag/pwd
/// pairs by default, with a dynamic fallback via registered
/// [`CredentialAuthority`] implementations.
#[derive(Default)]
pub struct CredentialsManager {
    tables: SyncMutex<Tables>,
    authorities: SyncMutex<Vec<Box<dyn CredentialAuthority>>>,
}

impl CredentialsManager {
    #[must_use]
    pub fn new() -> Self {
        CredentialsManager::default()
    }

    /// Registers this agent's own ufrag/pwd, deriving the short-term key used
    /// to verify requests addressed to it and to sign its own responses.
    pub fn set_local_credentials(&self, ufrag: &str, pwd: &str) {
        let key = short_term_key(pwd);
        self.tables.lock().unwrap().local.insert(ufrag.to_owned(), key);
    }

    /// Registers a remote peer's ufrag/pwd for a given media stream, deriving
    /// the short-term key used to verify its responses and to sign requests
    /// sent to it.
    pub fn set_remote_credentials(&self, ufrag: &str, pwd: &str, media: &str) {
        let key = short_term_key(pwd);
        self.tables
            .lock()
            .unwrap()
            .remote
            .insert((ufrag.to_owned(), media.to_owned()), key);
    }

    pub fn register_authority(&self, authority: Box<dyn CredentialAuthority>) {
        self.authorities.lock().unwrap().push(authority);
    }

    /// Looks up the key used to verify a request bearing USERNAME `user`, or
    /// to sign a response sent back to it. Falls back to registered
    /// authorities if no static local credential matches.
    #[must_use]
    pub fn get_local_key(&self, user: &str) -> Option<Vec<u8>> {
        if let Some(key) = self.tables.lock().unwrap().local.get(user).cloned() {
            return Some(key);
        }
        self.authorities
            .lock()
            .unwrap()
            .iter()
            .find_map(|a| a.local_key(user))
    }

    /// Looks up the key used to verify a response bearing USERNAME `user` for
    /// media stream `media`, or to sign a request sent to it. Falls back to
    /// registered authorities if no static remote credential matches.
    #[must_use]
    pub fn get_remote_key(&self, user: &str, media: &str) -> Option<Vec<u8>> {
        if let Some(key) = self
            .tables
            .lock()
            .unwrap()
            .remote
            .get(&(user.to_owned(), media.to_owned()))
            .cloned()
        {
            return Some(key);
        }
        self.authorities
            .lock()
            .unwrap()
            .iter()
            .find_map(|a| a.remote_key(user, media))
    }
}
