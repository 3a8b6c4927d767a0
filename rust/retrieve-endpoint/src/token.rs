//! Session-scoped authentication tokens.
//!
//! A token is 8 bytes of little-endian session id followed by 16 bytes of a
//! BLAKE3 keyed hash over the session and user ids. The key is drawn once per
//! registry and lives in its header, so the same session and user always get
//! the same token, even after the table entry was removed and recreated.
//! Session ids are never reused within a registry. The text form handed to
//! clients is `tk` followed by 48 hex digits.
//!
//! Entries live in the registry's token table. [`TokenStore`] is the mutable
//! view handed out under the registry's exclusive lock; [`lookup_session`]
//! only needs the shared lock.

use std::fmt;
use std::str::FromStr;

use crate::error::{EndpointError, Resource};
use crate::layout::{TOKEN_LEN, TokenEntry};

const TOKEN_PREFIX: &str = "tk";

/// An endpoint authentication token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Token of `session_id` and `user_id` under the registry key `key`.
    pub fn derive(key: &[u8; 32], session_id: u64, user_id: u32) -> Self {
        let mut input = [0u8; 12];
        input[..8].copy_from_slice(&session_id.to_le_bytes());
        input[8..].copy_from_slice(&user_id.to_le_bytes());
        let hash = blake3::keyed_hash(key, &input);

        let mut bytes = [0u8; TOKEN_LEN];
        bytes[..8].copy_from_slice(&session_id.to_le_bytes());
        bytes[8..].copy_from_slice(&hash.as_bytes()[..TOKEN_LEN - 8]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Session id embedded in the token.
    pub fn session_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(id)
    }

    /// Parse the `tk…` text form. Any malformation is an authentication
    /// failure.
    pub fn parse(text: &str) -> Result<Self, EndpointError> {
        let hex = text
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(EndpointError::AuthenticationFailed)?;
        if hex.len() != TOKEN_LEN * 2 {
            return Err(EndpointError::AuthenticationFailed);
        }
        let mut bytes = [0u8; TOKEN_LEN];
        for (byte, pair) in bytes.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
            let hi = hex_value(pair[0]).ok_or(EndpointError::AuthenticationFailed)?;
            let lo = hex_value(pair[1]).ok_or(EndpointError::AuthenticationFailed)?;
            *byte = hi << 4 | lo;
        }
        Ok(Self(bytes))
    }

    /// Comparison whose timing does not depend on where the tokens differ.
    pub fn ct_eq(&self, other: &[u8; TOKEN_LEN]) -> bool {
        self.0
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(TOKEN_PREFIX)?;
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

// Keep the secret out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl FromStr for Token {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Session that owns `token` for `user_id`.
///
/// More than one match fails closed.
pub fn lookup_session(entries: &[TokenEntry], user_id: u32, token: &Token) -> Option<u64> {
    let mut found = None;
    for entry in entries.iter().filter(|e| e.in_use != 0) {
        if entry.user_id == user_id && token.ct_eq(&entry.token) {
            if found.is_some() {
                tracing::warn!(user_id, "token matches more than one session");
                return None;
            }
            found = Some(entry.session_id);
        }
    }
    found
}

/// Mutable view of the token table.
pub struct TokenStore<'a> {
    entries: &'a mut [TokenEntry],
    key: [u8; 32],
}

impl<'a> TokenStore<'a> {
    pub fn new(entries: &'a mut [TokenEntry], key: [u8; 32]) -> Self {
        Self { entries, key }
    }

    fn position(&self, session_id: u64, user_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.in_use != 0 && e.session_id == session_id && e.user_id == user_id)
    }

    /// Token for the session and user. Creates the entry with zero
    /// references if there is none.
    pub fn get_or_create(&mut self, session_id: u64, user_id: u32) -> Result<Token, EndpointError> {
        let token = Token::derive(&self.key, session_id, user_id);
        if self.position(session_id, user_id).is_some() {
            return Ok(token);
        }

        let free = self
            .entries
            .iter()
            .position(|e| e.in_use == 0)
            .ok_or(EndpointError::ResourceExhausted(Resource::TokenTable))?;
        self.entries[free] = TokenEntry {
            session_id,
            user_id,
            ref_count: 0,
            in_use: 1,
            _pad: 0,
            token: *token.as_bytes(),
        };
        tracing::debug!(session_id, user_id, "created session token");
        Ok(token)
    }

    /// [`TokenStore::get_or_create`] plus one reference.
    pub fn acquire(&mut self, session_id: u64, user_id: u32) -> Result<Token, EndpointError> {
        let token = self.get_or_create(session_id, user_id)?;
        if let Some(i) = self.position(session_id, user_id) {
            self.entries[i].ref_count += 1;
        }
        Ok(token)
    }

    /// Drop one reference. The entry itself stays until
    /// [`TokenStore::remove_if_unused`].
    pub fn release(&mut self, session_id: u64, user_id: u32) {
        match self.position(session_id, user_id) {
            Some(i) => {
                let entry = &mut self.entries[i];
                if entry.ref_count == 0 {
                    tracing::warn!(session_id, user_id, "token reference count already zero");
                } else {
                    entry.ref_count -= 1;
                }
            }
            None => {
                tracing::warn!(session_id, user_id, "releasing token with no entry");
            }
        }
    }

    /// Delete the entry if no endpoint references it. Returns whether an
    /// entry was removed.
    pub fn remove_if_unused(&mut self, session_id: u64, user_id: u32) -> bool {
        match self.position(session_id, user_id) {
            Some(i) if self.entries[i].ref_count == 0 => {
                self.entries[i] = TokenEntry::EMPTY;
                tracing::debug!(session_id, user_id, "removed session token");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, session_id: u64, user_id: u32) -> Option<Token> {
        self.position(session_id, user_id)
            .map(|i| Token(self.entries[i].token))
    }

    pub fn ref_count(&self, session_id: u64, user_id: u32) -> Option<u32> {
        self.position(session_id, user_id)
            .map(|i| self.entries[i].ref_count)
    }

    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use != 0).count()
    }

    pub fn lookup_session(&self, user_id: u32, token: &Token) -> Option<u64> {
        lookup_session(self.entries, user_id, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x5A; 32];

    fn table(n: usize) -> Vec<TokenEntry> {
        vec![TokenEntry::EMPTY; n]
    }

    #[test]
    fn get_or_create_is_idempotent_per_session_and_user() {
        let mut entries = table(4);
        let mut store = TokenStore::new(&mut entries, KEY);
        let a = store.get_or_create(7, 100).unwrap();
        let b = store.get_or_create(7, 100).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.in_use(), 1);
        assert_eq!(a.session_id(), 7);
    }

    #[test]
    fn different_sessions_get_different_tokens() {
        let mut entries = table(4);
        let mut store = TokenStore::new(&mut entries, KEY);
        let a = store.get_or_create(1, 100).unwrap();
        let b = store.get_or_create(2, 100).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.lookup_session(100, &a), Some(1));
        assert_eq!(store.lookup_session(100, &b), Some(2));
        assert_eq!(store.lookup_session(101, &a), None, "wrong user");
    }

    #[test]
    fn ref_counting_and_removal() {
        let mut entries = table(2);
        let mut store = TokenStore::new(&mut entries, KEY);
        store.acquire(3, 9).unwrap();
        store.acquire(3, 9).unwrap();
        assert_eq!(store.ref_count(3, 9), Some(2));
        assert!(!store.remove_if_unused(3, 9));

        store.release(3, 9);
        store.release(3, 9);
        assert_eq!(store.ref_count(3, 9), Some(0));
        // Extra release is clamped, not an error.
        store.release(3, 9);
        assert_eq!(store.ref_count(3, 9), Some(0));

        assert!(store.remove_if_unused(3, 9));
        assert_eq!(store.in_use(), 0);
    }

    #[test]
    fn recreated_entry_has_the_same_token() {
        let mut entries = table(2);
        let mut store = TokenStore::new(&mut entries, KEY);
        let first = store.acquire(3, 9).unwrap();
        assert_eq!(store.get(3, 9), Some(first));
        store.release(3, 9);
        assert!(store.remove_if_unused(3, 9));
        assert_eq!(store.get(3, 9), None);
        assert_eq!(store.lookup_session(9, &first), None);

        let again = store.acquire(3, 9).unwrap();
        assert_eq!(again, first);
        assert_eq!(store.lookup_session(9, &first), Some(3));
    }

    #[test]
    fn tokens_depend_on_key_session_and_user() {
        let base = Token::derive(&KEY, 3, 9);
        assert_eq!(base, Token::derive(&KEY, 3, 9));
        assert_eq!(base.session_id(), 3);
        for other in [
            Token::derive(&[0xA5; 32], 3, 9),
            Token::derive(&KEY, 4, 9),
            Token::derive(&KEY, 3, 10),
        ] {
            assert_ne!(other, base);
        }
    }

    #[test]
    fn full_table_is_resource_exhaustion() {
        let mut entries = table(1);
        let mut store = TokenStore::new(&mut entries, KEY);
        store.get_or_create(1, 1).unwrap();
        assert!(matches!(
            store.get_or_create(2, 1),
            Err(EndpointError::ResourceExhausted(Resource::TokenTable))
        ));
    }

    #[test]
    fn text_form_round_trips_and_rejects_garbage() {
        let token = Token::derive(&KEY, 0xABCD, 1);
        let text = token.to_string();
        assert!(text.starts_with("tk"));
        assert_eq!(text.len(), 2 + 48);
        assert_eq!(Token::parse(&text).unwrap(), token);
        assert_eq!(text.to_lowercase().parse::<Token>().unwrap(), token);

        let upper_prefix = text.replace('t', "T");
        for bad in ["", "tk", "xx00", &text[..text.len() - 1], upper_prefix.as_str()] {
            assert!(matches!(
                Token::parse(bad),
                Err(EndpointError::AuthenticationFailed)
            ));
        }
        let mut not_hex = text.clone();
        not_hex.replace_range(5..6, "G");
        assert!(Token::parse(&not_hex).is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let token = Token::derive(&KEY, 5, 1);
        let debug = format!("{:?}", token);
        assert!(!debug.contains(&token.to_string()[2..]));
        assert!(debug.contains("session_id: 5"));
    }
}
