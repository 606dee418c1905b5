//! Optimistic reconciliation layer.
//!
//! Gives the UI immediate feedback without duplication or loss. A send
//! inserts a provisional entry keyed by a client-generated correlation id;
//! the canonical record later arrives over the HTTP response, the push
//! stream, or both, in either order. Whatever the interleaving, the view
//! holds at most one visible entry per correlation id at any time.
//!
//! The cache is explicit and keyed by conversation id; nothing here is
//! ambient global state.

use dashmap::DashMap;
use uuid::Uuid;

use odm_core::Message;

/// Mints a client correlation id tying a provisional entry to its canonical
/// record.
pub fn new_correlation_id() -> String {
    nanoid::nanoid!()
}

/// One visible row of a conversation view.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleMessage {
    pub message: Message,
    /// Still awaiting server confirmation.
    pub provisional: bool,
}

#[derive(Debug, Clone)]
enum Entry {
    Provisional {
        correlation_id: String,
        message: Message,
    },
    Canonical {
        message: Message,
    },
}

impl Entry {
    fn visible(&self) -> VisibleMessage {
        match self {
            Entry::Provisional { message, .. } => VisibleMessage {
                message: message.clone(),
                provisional: true,
            },
            Entry::Canonical { message } => VisibleMessage {
                message: message.clone(),
                provisional: false,
            },
        }
    }

    fn correlation_id(&self) -> Option<&str> {
        match self {
            Entry::Provisional { correlation_id, .. } => Some(correlation_id),
            Entry::Canonical { message } => message.metadata.correlation_id.as_deref(),
        }
    }

    fn canonical_id(&self) -> Option<Uuid> {
        match self {
            Entry::Provisional { .. } => None,
            Entry::Canonical { message } => Some(message.id),
        }
    }
}

/// Per-conversation optimistic cache with append/reconcile operations.
#[derive(Default)]
pub struct ConversationCache {
    views: DashMap<Uuid, Vec<Entry>>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a provisional pending entry. If the canonical record for this
    /// correlation id already arrived (stream won the race), the push is
    /// dropped instead of duplicating.
    pub fn push_provisional(&self, conversation_id: Uuid, correlation_id: &str, draft: Message) {
        let mut view = self.views.entry(conversation_id).or_default();
        if view
            .iter()
            .any(|entry| entry.correlation_id() == Some(correlation_id))
        {
            return;
        }
        view.push(Entry::Provisional {
            correlation_id: correlation_id.to_string(),
            message: draft,
        });
    }

    /// Replaces the provisional entry with its canonical record (HTTP
    /// response path). If the canonical record already arrived via the
    /// stream, the provisional entry is simply dropped.
    pub fn resolve_success(
        &self,
        conversation_id: Uuid,
        correlation_id: &str,
        canonical: Message,
    ) {
        let mut view = self.views.entry(conversation_id).or_default();
        let already_canonical = view.iter().any(|entry| {
            entry.canonical_id() == Some(canonical.id)
                || (matches!(entry, Entry::Canonical { .. })
                    && entry.correlation_id() == Some(correlation_id))
        });

        if already_canonical {
            view.retain(|entry| {
                !matches!(entry, Entry::Provisional { correlation_id: c, .. } if c == correlation_id)
            });
            return;
        }

        if let Some(position) = view.iter().position(|entry| {
            matches!(entry, Entry::Provisional { correlation_id: c, .. } if c == correlation_id)
        }) {
            view[position] = Entry::Canonical { message: canonical };
        } else {
            view.push(Entry::Canonical { message: canonical });
        }
    }

    /// Rolls the view back to its pre-send state (send failed). Returns the
    /// rolled-back view so callers can surface it together with the failure.
    pub fn resolve_failure(
        &self,
        conversation_id: Uuid,
        correlation_id: &str,
    ) -> Vec<VisibleMessage> {
        let mut view = self.views.entry(conversation_id).or_default();
        view.retain(|entry| {
            !matches!(entry, Entry::Provisional { correlation_id: c, .. } if c == correlation_id)
        });
        view.iter().map(Entry::visible).collect()
    }

    /// Stream path: inserts a canonical record, deduplicating by canonical id
    /// and by correlation id. A canonical record may arrive here before the
    /// HTTP response to the request that created it; both paths converge on
    /// exactly one visible message. Returns whether the view changed.
    pub fn ingest_canonical(&self, conversation_id: Uuid, message: Message) -> bool {
        let mut view = self.views.entry(conversation_id).or_default();
        if view
            .iter()
            .any(|entry| entry.canonical_id() == Some(message.id))
        {
            return false;
        }

        if let Some(correlation_id) = message.metadata.correlation_id.clone() {
            if let Some(position) = view.iter().position(|entry| {
                matches!(entry, Entry::Provisional { correlation_id: c, .. } if *c == correlation_id)
            }) {
                view[position] = Entry::Canonical { message };
                return true;
            }
            if view.iter().any(|entry| {
                matches!(entry, Entry::Canonical { .. })
                    && entry.correlation_id() == Some(correlation_id.as_str())
            }) {
                return false;
            }
        }

        view.push(Entry::Canonical { message });
        true
    }

    /// The append-ordered view for one conversation.
    pub fn visible(&self, conversation_id: Uuid) -> Vec<VisibleMessage> {
        self.views
            .get(&conversation_id)
            .map(|view| view.iter().map(Entry::visible).collect())
            .unwrap_or_default()
    }

    /// Drops a conversation's view entirely (view closed or switched).
    pub fn clear(&self, conversation_id: Uuid) {
        self.views.remove(&conversation_id);
    }
}
