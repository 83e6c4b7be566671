//! Session identity: one id per browsing context, kept in session storage.

use analytics_store::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, OnceLock};
use uuid::Uuid;

use crate::error::{TelemetryError, TelemetryResult};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;

/// Storage scoped to one browsing context (survives navigation, best-effort
/// across anything else).
pub trait SessionStorage: Send + Sync + Debug {
    fn get(&self, key: &str) -> TelemetryResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> TelemetryResult<()>;
}

/// In-process session storage. Clones share entries, so two trackers built
/// over the same storage behave like two page loads in one tab.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> TelemetryResult<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| TelemetryError::Storage("storage lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> TelemetryResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| TelemetryError::Storage("storage lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Storage that refuses every access, as when the browser blocks it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedSessionStorage;

impl SessionStorage for BlockedSessionStorage {
    fn get(&self, _key: &str) -> TelemetryResult<Option<String>> {
        Err(TelemetryError::Storage("access denied".to_string()))
    }

    fn set(&self, _key: &str, _value: &str) -> TelemetryResult<()> {
        Err(TelemetryError::Storage("access denied".to_string()))
    }
}

/// Hands out the session id for this browsing context.
#[derive(Debug)]
pub struct SessionIdentity {
    storage: Arc<dyn SessionStorage>,
    key: String,
    clock: Arc<dyn Clock>,
    session_id: OnceLock<String>,
}

impl SessionIdentity {
    pub fn new(storage: Arc<dyn SessionStorage>, key: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            key: key.to_string(),
            clock,
            session_id: OnceLock::new(),
        }
    }

    /// The session id. Stable for the lifetime of this value; never fails.
    pub fn session_id(&self) -> &str {
        self.session_id.get_or_init(|| self.load_or_mint())
    }

    fn load_or_mint(&self) -> String {
        match self.storage.get(&self.key) {
            Ok(Some(existing)) if !existing.is_empty() => {
                tracing::debug!(session_id = %existing, "Resumed session");
                return existing;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Session storage unreadable, using in-memory session id");
                return mint_session_id(self.clock.now());
            }
        }

        let minted = mint_session_id(self.clock.now());
        if let Err(e) = self.storage.set(&self.key, &minted) {
            tracing::warn!(error = %e, "Could not persist session id, keeping it in memory");
        }
        tracing::debug!(session_id = %minted, "Started session");
        minted
    }
}

/// `session_<epochMillis>_<9 base-36 chars>`
pub fn mint_session_id(now: DateTime<Utc>) -> String {
    let mut entropy = Uuid::new_v4().as_u128();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| {
            let digit = (entropy % 36) as usize;
            entropy /= 36;
            BASE36[digit] as char
        })
        .collect();
    format!("session_{}_{}", now.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use analytics_store::{ManualClock, SystemClock};
    use chrono::TimeZone;

    fn identity(storage: Arc<dyn SessionStorage>) -> SessionIdentity {
        SessionIdentity::new(storage, "sid", Arc::new(SystemClock))
    }

    #[test]
    fn test_mint_session_id_format() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let id = mint_session_id(now);

        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert_eq!(parts[1], now.timestamp_millis().to_string());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_mint_session_id_unique() {
        let now = Utc::now();
        assert_ne!(mint_session_id(now), mint_session_id(now));
    }

    #[test]
    fn test_session_id_is_stable() {
        let identity = identity(Arc::new(MemorySessionStorage::new()));
        let first = identity.session_id().to_string();
        assert_eq!(identity.session_id(), first);
        assert_eq!(identity.session_id(), first);
    }

    #[test]
    fn test_session_id_written_to_storage() {
        let storage = MemorySessionStorage::new();
        let identity = identity(Arc::new(storage.clone()));
        let id = identity.session_id().to_string();
        assert_eq!(storage.get("sid").unwrap(), Some(id));
    }

    #[test]
    fn test_session_id_survives_navigation() {
        let storage = MemorySessionStorage::new();
        let first_page = identity(Arc::new(storage.clone()));
        let second_page = identity(Arc::new(storage.clone()));
        assert_eq!(first_page.session_id(), second_page.session_id());
    }

    #[test]
    fn test_separate_tabs_get_separate_sessions() {
        let tab_a = identity(Arc::new(MemorySessionStorage::new()));
        let tab_b = identity(Arc::new(MemorySessionStorage::new()));
        assert_ne!(tab_a.session_id(), tab_b.session_id());
    }

    #[test]
    fn test_blocked_storage_falls_back_to_memory() {
        let identity = identity(Arc::new(BlockedSessionStorage));
        let id = identity.session_id().to_string();
        assert!(id.starts_with("session_"));
        assert_eq!(identity.session_id(), id);
    }

    #[test]
    fn test_empty_stored_value_is_replaced() {
        let storage = MemorySessionStorage::new();
        storage.set("sid", "").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let identity = SessionIdentity::new(
            Arc::new(storage.clone()),
            "sid",
            Arc::new(ManualClock::new(start)),
        );

        let id = identity.session_id();
        assert!(id.starts_with(&format!("session_{}_", start.timestamp_millis())));
        assert_eq!(storage.get("sid").unwrap().as_deref(), Some(id));
    }
}
