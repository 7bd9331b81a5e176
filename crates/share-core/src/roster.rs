//! Roster store for ephemeral peer identities.
//!
//! Tracks who is present in each discovery scope. Every mutation returns the
//! full snapshot of the affected scope so the caller can broadcast it in the
//! same step: consumers treat each snapshot as an authoritative replacement,
//! never as a diff.

use crate::group::GroupCode;
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// A named broadcast domain for roster snapshots.
///
/// Serialized as a plain string: `"local"` for the unscoped discovery pool,
/// the group code otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Scope {
    /// Anyone connected to the relay who entered local discovery
    Local,
    /// Members of one group
    Group(GroupCode),
}

impl Scope {
    const LOCAL: &'static str = "local";
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Local => f.write_str(Self::LOCAL),
            Scope::Group(code) => write!(f, "{}", code),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> String {
        scope.to_string()
    }
}

impl From<String> for Scope {
    fn from(s: String) -> Self {
        if s == Scope::LOCAL {
            Scope::Local
        } else {
            Scope::Group(GroupCode::from(s))
        }
    }
}

/// One peer present in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub peer_id: PeerId,
    pub display_name: String,
}

impl RosterEntry {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
        }
    }
}

/// Full member list of one scope at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSnapshot {
    pub scope: Scope,
    pub entries: Vec<RosterEntry>,
}

impl RosterSnapshot {
    /// Peers that should receive this snapshot.
    pub fn recipients(&self) -> Vec<PeerId> {
        self.entries.iter().map(|e| e.peer_id).collect()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.iter().any(|e| &e.peer_id == peer_id)
    }
}

/// Ordered member list with upsert semantics (one entry per peer).
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.peer_id`. A replaced entry keeps
    /// its position.
    pub fn upsert(&mut self, entry: RosterEntry) {
        match self.entries.iter_mut().find(|e| e.peer_id == entry.peer_id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove a peer. Returns false if it was not present.
    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.peer_id != peer_id);
        self.entries.len() != before
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.iter().any(|e| &e.peer_id == peer_id)
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.entries.iter().map(|e| e.peer_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scope-keyed rosters.
#[derive(Debug, Default)]
pub struct RosterStore {
    scopes: HashMap<Scope, Roster>,
}

impl RosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert of `peer_id` into `scope`. Returns the new snapshot.
    pub fn enter(
        &mut self,
        scope: Scope,
        peer_id: PeerId,
        display_name: impl Into<String>,
    ) -> RosterSnapshot {
        self.scopes
            .entry(scope.clone())
            .or_default()
            .upsert(RosterEntry::new(peer_id, display_name));
        self.snapshot(&scope)
    }

    /// Remove `peer_id` from `scope`. Returns `None` (nothing to broadcast)
    /// if the peer was not present.
    pub fn leave(&mut self, scope: &Scope, peer_id: &PeerId) -> Option<RosterSnapshot> {
        let roster = self.scopes.get_mut(scope)?;
        if !roster.remove(peer_id) {
            return None;
        }
        if roster.is_empty() {
            self.scopes.remove(scope);
        }
        Some(self.snapshot(scope))
    }

    /// Remove a peer from every scope it belongs to.
    ///
    /// Returns one snapshot per affected scope (possibly with no entries left,
    /// in which case there is nobody to send it to).
    pub fn on_disconnect(&mut self, peer_id: &PeerId) -> Vec<RosterSnapshot> {
        let scopes: Vec<Scope> = self
            .scopes
            .iter()
            .filter(|(_, roster)| roster.contains(peer_id))
            .map(|(scope, _)| scope.clone())
            .collect();

        scopes
            .into_iter()
            .filter_map(|scope| self.leave(&scope, peer_id))
            .collect()
    }

    pub fn snapshot(&self, scope: &Scope) -> RosterSnapshot {
        RosterSnapshot {
            scope: scope.clone(),
            entries: self
                .scopes
                .get(scope)
                .map(|r| r.entries().to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn members(&self, scope: &Scope) -> Vec<PeerId> {
        self.scopes
            .get(scope)
            .map(|r| r.peer_ids())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_a() -> PeerId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    fn peer_b() -> PeerId {
        "1234567890abcdef".parse().unwrap()
    }

    fn group_scope() -> Scope {
        Scope::Group(GroupCode::from("123456".to_string()))
    }

    #[test]
    fn test_enter_broadcasts_full_snapshot() {
        let mut store = RosterStore::new();
        store.enter(Scope::Local, peer_a(), "Alice");
        let snapshot = store.enter(Scope::Local, peer_b(), "Bob");

        assert_eq!(snapshot.scope, Scope::Local);
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.contains(&peer_a()));
        assert!(snapshot.contains(&peer_b()));
    }

    #[test]
    fn test_enter_is_idempotent_and_replaces_name() {
        let mut store = RosterStore::new();
        store.enter(Scope::Local, peer_a(), "Alice");
        let snapshot = store.enter(Scope::Local, peer_a(), "Alice 2");

        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].display_name, "Alice 2");
    }

    #[test]
    fn test_leave_absent_peer_is_noop() {
        let mut store = RosterStore::new();
        assert!(store.leave(&Scope::Local, &peer_a()).is_none());

        store.enter(Scope::Local, peer_b(), "Bob");
        assert!(store.leave(&Scope::Local, &peer_a()).is_none());
        assert_eq!(store.members(&Scope::Local), vec![peer_b()]);
    }

    #[test]
    fn test_leave_returns_remaining_members() {
        let mut store = RosterStore::new();
        store.enter(Scope::Local, peer_a(), "Alice");
        store.enter(Scope::Local, peer_b(), "Bob");

        let snapshot = store.leave(&Scope::Local, &peer_a()).unwrap();
        assert_eq!(snapshot.recipients(), vec![peer_b()]);
    }

    #[test]
    fn test_disconnect_removes_from_every_scope() {
        let mut store = RosterStore::new();
        store.enter(Scope::Local, peer_a(), "Alice");
        store.enter(Scope::Local, peer_b(), "Bob");
        store.enter(group_scope(), peer_a(), "Alice");

        let snapshots = store.on_disconnect(&peer_a());

        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| !s.contains(&peer_a())));
        assert!(!store.members(&Scope::Local).contains(&peer_a()));
        assert!(!store.members(&group_scope()).contains(&peer_a()));
        assert!(store.members(&Scope::Local).contains(&peer_b()));
    }

    #[test]
    fn test_scope_string_form() {
        assert_eq!(serde_json::to_string(&Scope::Local).unwrap(), "\"local\"");
        assert_eq!(serde_json::to_string(&group_scope()).unwrap(), "\"123456\"");
        let parsed: Scope = serde_json::from_str("\"654321\"").unwrap();
        assert_eq!(parsed, Scope::Group(GroupCode::from("654321")));
    }
}
