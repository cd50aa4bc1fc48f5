//! Live streaming sessions keyed by request id.
//!
//! The issuer inserts, the read loop removes, the controller cancels. All three
//! are idempotent, so the order in which they race does not matter: whichever
//! of `remove`/`cancel` runs first wins and the other reports `false`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use pal_core::ids::RequestId;

/// What the registry holds for one in-flight request.
#[derive(Clone, Debug)]
pub struct SessionEntry {
    pub cancel: CancellationToken,
    pub model: String,
    pub started_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            model: model.into(),
            started_at: Utc::now(),
        }
    }
}

/// Snapshot of a registered session. Only live sessions are registered; how
/// a session ended is carried by its terminal increment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub request_id: RequestId,
    pub model: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    sessions: DashMap<RequestId, SessionEntry>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` if the id is already present; the existing entry is kept.
    pub fn register(&self, request_id: RequestId, entry: SessionEntry) -> bool {
        match self.sessions.entry(request_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn get(&self, request_id: &RequestId) -> Option<SessionInfo> {
        self.sessions.get(request_id).map(|entry| SessionInfo {
            request_id: request_id.clone(),
            model: entry.model.clone(),
            started_at: entry.started_at,
        })
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.sessions.contains_key(request_id)
    }

    /// Remove the session and fire its token. Unknown or finished ids are a
    /// no-op returning `false`.
    ///
    /// The token fires under the shard lock, so a concurrent `remove` that
    /// finds nothing always observes the token as cancelled.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.sessions
            .remove_if(request_id, |_, entry| {
                entry.cancel.cancel();
                true
            })
            .is_some()
    }

    pub fn remove(&self, request_id: &RequestId) -> bool {
        self.sessions.remove(request_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every live session. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<RequestId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_remove() {
        let registry = StreamRegistry::new();
        let id = RequestId::new();
        assert!(registry.register(id.clone(), SessionEntry::new("m")));
        assert_eq!(registry.len(), 1);

        let info = registry.get(&id).unwrap();
        assert_eq!(info.model, "m");
        assert_eq!(info.request_id, id);

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn duplicate_register_keeps_first() {
        let registry = StreamRegistry::new();
        let id = RequestId::from_raw("req_dup");
        let first = SessionEntry::new("first");
        let first_token = first.cancel.clone();
        assert!(registry.register(id.clone(), first));
        assert!(!registry.register(id.clone(), SessionEntry::new("second")));
        assert_eq!(registry.get(&id).unwrap().model, "first");

        assert!(registry.cancel(&id));
        assert!(first_token.is_cancelled());
    }

    #[test]
    fn cancel_fires_token_once() {
        let registry = StreamRegistry::new();
        let id = RequestId::new();
        let entry = SessionEntry::new("m");
        let token = entry.cancel.clone();
        registry.register(id.clone(), entry);

        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&id));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn cancel_unknown_is_false() {
        let registry = StreamRegistry::new();
        assert!(!registry.cancel(&RequestId::from_raw("req_nope")));
    }

    #[test]
    fn cancel_after_remove_is_false() {
        let registry = StreamRegistry::new();
        let id = RequestId::new();
        let entry = SessionEntry::new("m");
        let token = entry.cancel.clone();
        registry.register(id.clone(), entry);
        registry.remove(&id);

        assert!(!registry.cancel(&id));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_all_counts() {
        let registry = StreamRegistry::new();
        let tokens: Vec<CancellationToken> = (0..3)
            .map(|_| {
                let entry = SessionEntry::new("m");
                let token = entry.cancel.clone();
                registry.register(RequestId::new(), entry);
                token
            })
            .collect();

        assert_eq!(registry.cancel_all(), 3);
        assert!(registry.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(registry.cancel_all(), 0);
    }
}
