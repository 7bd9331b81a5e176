//! Group lifecycle: create, join, time-bounded join window, open-share toggle,
//! disband, and membership change.
//!
//! A group moves through `OpenForJoin -> JoinClosed -> Disbanded`, where
//! `Disbanded` is terminal and reachable from either live phase. Expiry of the
//! join window only blocks new joins; existing members carry on.
//!
//! Invariant: `host_id` always names a current member. Any path that would
//! remove the host disbands the group instead.

use crate::clock::Clock;
use crate::roster::{Roster, RosterEntry, RosterSnapshot, Scope};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Join window applied when the creator does not ask for one.
pub const DEFAULT_JOIN_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Upper bound on a requested join window.
pub const MAX_JOIN_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempts at drawing an unused code before giving up.
const MAX_CODE_ATTEMPTS: usize = 32;

/// Disband reason when the host disbands explicitly.
pub const REASON_HOST_DISBANDED: &str = "host disbanded";

/// Disband reason when the host disconnects or leaves.
pub const REASON_HOST_LEFT: &str = "host left";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("Group not found: {0}")]
    GroupNotFound(GroupCode),
    #[error("Join window closed for group {0}")]
    JoinWindowClosed(GroupCode),
    #[error("Peer {0} is not the host")]
    NotHost(PeerId),
    #[error("Peer {peer} is not a member of group {code}")]
    NotMember { code: GroupCode, peer: PeerId },
    #[error("Could not allocate a group code")]
    CreateFailed,
}

/// Six-digit session code.
///
/// Parsing is permissive: any string can be looked up, unknown or malformed
/// codes simply are not found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupCode(String);

impl GroupCode {
    /// Draw a random code in `100000..=999999`.
    pub fn generate() -> Self {
        use rand::Rng;
        let n: u32 = rand::rng().random_range(100_000..1_000_000);
        Self(n.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 6 && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl Display for GroupCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for GroupCode {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GroupCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Live phase of a group. Deleted groups are `Disbanded` by absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupPhase {
    OpenForJoin,
    JoinClosed,
}

/// Handle to the deferred join-window transition. Cancelling must guarantee
/// the callback never fires for this group instance.
pub trait ScheduledTask: Send {
    fn cancel(&mut self);
}

/// Schedules the join-window transition for a group.
///
/// When the delay elapses, the implementation arranges for
/// [`GroupManager::close_join_window`] to be called with the code.
pub trait JoinWindowScheduler: Send {
    fn schedule(&mut self, code: &GroupCode, after: Duration) -> Box<dyn ScheduledTask>;
}

/// A live group.
pub struct Group {
    code: GroupCode,
    host_id: PeerId,
    created_at_ms: u64,
    join_window: Duration,
    open_share: bool,
    phase: GroupPhase,
    members: Roster,
    timer: Option<Box<dyn ScheduledTask>>,
}

impl Group {
    pub fn code(&self) -> &GroupCode {
        &self.code
    }

    pub fn host_id(&self) -> PeerId {
        self.host_id
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn join_window(&self) -> Duration {
        self.join_window
    }

    /// Last instant (inclusive) at which a join succeeds.
    pub fn join_deadline_ms(&self) -> u64 {
        self.created_at_ms + self.join_window.as_millis() as u64
    }

    pub fn open_share(&self) -> bool {
        self.open_share
    }

    pub fn phase(&self) -> GroupPhase {
        self.phase
    }

    pub fn members(&self) -> &[RosterEntry] {
        self.members.entries()
    }

    pub fn is_member(&self, peer_id: &PeerId) -> bool {
        self.members.contains(peer_id)
    }

    pub fn member_ids(&self) -> Vec<PeerId> {
        self.members.peer_ids()
    }

    fn accepts_joins_at(&self, now_ms: u64) -> bool {
        self.phase == GroupPhase::OpenForJoin && now_ms <= self.join_deadline_ms()
    }

    fn snapshot(&self) -> RosterSnapshot {
        RosterSnapshot {
            scope: Scope::Group(self.code.clone()),
            entries: self.members.entries().to_vec(),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreated {
    pub code: GroupCode,
    pub host_id: PeerId,
    pub open_share: bool,
    pub roster: RosterSnapshot,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupJoined {
    pub code: GroupCode,
    pub host_id: PeerId,
    pub open_share: bool,
    pub roster: RosterSnapshot,
}

/// The open-share flag changed; `recipients` are all current members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenShareChanged {
    pub code: GroupCode,
    pub value: bool,
    pub recipients: Vec<PeerId>,
}

/// A group was destroyed; `recipients` are the members at destruction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDisbanded {
    pub code: GroupCode,
    pub reason: String,
    pub recipients: Vec<PeerId>,
}

/// The join window elapsed for a group that still exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClosed {
    pub code: GroupCode,
    pub recipients: Vec<PeerId>,
}

/// Outcome of removing one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRemoved {
    /// A regular member left; remaining members get this snapshot
    Left(RosterSnapshot),
    /// The host left, so the group is gone
    Disbanded(GroupDisbanded),
}

/// Owner of all live groups. The sole mutator of membership and open-share.
pub struct GroupManager<S: JoinWindowScheduler> {
    groups: HashMap<GroupCode, Group>,
    clock: Arc<dyn Clock>,
    scheduler: S,
    default_join_window: Duration,
    max_join_window: Duration,
}

impl<S: JoinWindowScheduler> GroupManager<S> {
    pub fn new(clock: Arc<dyn Clock>, scheduler: S) -> Self {
        Self {
            groups: HashMap::new(),
            clock,
            scheduler,
            default_join_window: DEFAULT_JOIN_WINDOW,
            max_join_window: MAX_JOIN_WINDOW,
        }
    }

    /// Override the default and maximum join windows.
    pub fn with_join_window_limits(mut self, default: Duration, max: Duration) -> Self {
        self.default_join_window = default;
        self.max_join_window = max.max(default);
        self
    }

    /// Resolve a requested window in minutes. `None` and zero take the default.
    pub fn resolve_join_window(&self, minutes: Option<u64>) -> Duration {
        match minutes {
            Some(m) if m > 0 => Duration::from_secs(m.saturating_mul(60)).min(self.max_join_window),
            _ => self.default_join_window,
        }
    }

    /// Create a group hosted by `host`, who becomes its only member.
    pub fn create(
        &mut self,
        host: PeerId,
        display_name: impl Into<String>,
        join_window_minutes: Option<u64>,
    ) -> Result<GroupCreated, GroupError> {
        let created_at_ms = self.clock.now_ms();
        let code = self.allocate_code()?;
        let join_window = self.resolve_join_window(join_window_minutes);
        let mut members = Roster::new();
        members.upsert(RosterEntry::new(host, display_name));

        let timer = self.scheduler.schedule(&code, join_window);
        let group = Group {
            code: code.clone(),
            host_id: host,
            created_at_ms,
            join_window,
            open_share: false,
            phase: GroupPhase::OpenForJoin,
            members,
            timer: Some(timer),
        };

        let created = GroupCreated {
            code: code.clone(),
            host_id: host,
            open_share: group.open_share,
            roster: group.snapshot(),
        };

        info!(
            "Group {} created by {} (join window {}s)",
            code,
            host.short(),
            join_window.as_secs()
        );
        self.groups.insert(code, group);
        Ok(created)
    }

    fn allocate_code(&self) -> Result<GroupCode, GroupError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = GroupCode::generate();
            if !self.groups.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(GroupError::CreateFailed)
    }

    /// Add `peer` to the group while its join window is open.
    ///
    /// Joining at exactly the deadline succeeds; any later instant fails.
    pub fn join(
        &mut self,
        code: &GroupCode,
        peer: PeerId,
        display_name: impl Into<String>,
    ) -> Result<GroupJoined, GroupError> {
        let now = self.clock.now_ms();
        let group = self
            .groups
            .get_mut(code)
            .ok_or_else(|| GroupError::GroupNotFound(code.clone()))?;

        if !group.accepts_joins_at(now) {
            debug!("Join to {} by {} refused: window closed", code, peer.short());
            return Err(GroupError::JoinWindowClosed(code.clone()));
        }

        group.members.upsert(RosterEntry::new(peer, display_name));
        info!(
            "Peer {} joined group {} ({} members)",
            peer.short(),
            code,
            group.members.len()
        );

        Ok(GroupJoined {
            code: code.clone(),
            host_id: group.host_id,
            open_share: group.open_share,
            roster: group.snapshot(),
        })
    }

    /// Host-only toggle of the open-share flag.
    pub fn set_open_share(
        &mut self,
        code: &GroupCode,
        peer: PeerId,
        value: bool,
    ) -> Result<OpenShareChanged, GroupError> {
        let group = self
            .groups
            .get_mut(code)
            .ok_or_else(|| GroupError::GroupNotFound(code.clone()))?;

        if group.host_id != peer {
            return Err(GroupError::NotHost(peer));
        }

        group.open_share = value;
        debug!("Group {} open-share set to {}", code, value);
        Ok(OpenShareChanged {
            code: code.clone(),
            value,
            recipients: group.member_ids(),
        })
    }

    /// Host-only disband. Cancels the pending join-window timer.
    pub fn disband(&mut self, code: &GroupCode, peer: PeerId) -> Result<GroupDisbanded, GroupError> {
        let group = self
            .groups
            .get(code)
            .ok_or_else(|| GroupError::GroupNotFound(code.clone()))?;

        if group.host_id != peer {
            return Err(GroupError::NotHost(peer));
        }

        Ok(self.destroy(code, REASON_HOST_DISBANDED))
    }

    /// Remove one member. A departing host disbands the whole group.
    pub fn remove_member(
        &mut self,
        code: &GroupCode,
        peer: PeerId,
    ) -> Result<MemberRemoved, GroupError> {
        let group = self
            .groups
            .get_mut(code)
            .ok_or_else(|| GroupError::GroupNotFound(code.clone()))?;

        if !group.members.contains(&peer) {
            return Err(GroupError::NotMember {
                code: code.clone(),
                peer,
            });
        }

        if group.host_id == peer {
            group.members.remove(&peer);
            return Ok(MemberRemoved::Disbanded(self.destroy(code, REASON_HOST_LEFT)));
        }

        group.members.remove(&peer);
        debug!("Peer {} left group {}", peer.short(), code);
        Ok(MemberRemoved::Left(group.snapshot()))
    }

    /// Remove a disconnected peer from every group it belongs to.
    pub fn on_disconnect(&mut self, peer: PeerId) -> Vec<MemberRemoved> {
        let codes: Vec<GroupCode> = self
            .groups
            .values()
            .filter(|g| g.is_member(&peer))
            .map(|g| g.code.clone())
            .collect();

        codes
            .iter()
            .filter_map(|code| self.remove_member(code, peer).ok())
            .collect()
    }

    /// Deferred join-window transition.
    ///
    /// Returns `None` when the group no longer exists (stale timer) or the
    /// window was already closed. A timer that fires while the deadline has
    /// not yet passed on the group clock is rearmed for the remainder.
    pub fn close_join_window(&mut self, code: &GroupCode) -> Option<JoinClosed> {
        let now = self.clock.now_ms();
        let group = self.groups.get_mut(code)?;
        group.timer = None;
        if group.phase == GroupPhase::JoinClosed {
            return None;
        }
        let deadline = group.join_deadline_ms();
        if now <= deadline {
            let remaining = Duration::from_millis(deadline - now + 1);
            debug!("Join timer for {} fired early, rearming for {:?}", code, remaining);
            group.timer = Some(self.scheduler.schedule(code, remaining));
            return None;
        }
        group.phase = GroupPhase::JoinClosed;
        info!("Join window closed for group {}", code);
        Some(JoinClosed {
            code: code.clone(),
            recipients: group.member_ids(),
        })
    }

    /// Whether `from` may send files to `to` within the group.
    ///
    /// With open-share off, only the host may send to anyone; other members
    /// may only send to the host. Unknown groups impose no restriction.
    pub fn may_send(&self, code: &GroupCode, from: &PeerId, to: &PeerId) -> bool {
        match self.groups.get(code) {
            Some(group) => group.open_share || group.host_id == *from || group.host_id == *to,
            None => true,
        }
    }

    pub fn get(&self, code: &GroupCode) -> Option<&Group> {
        self.groups.get(code)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn destroy(&mut self, code: &GroupCode, reason: &str) -> GroupDisbanded {
        let recipients = match self.groups.remove(code) {
            Some(mut group) => {
                group.cancel_timer();
                group.member_ids()
            }
            None => Vec::new(),
        };
        info!("Group {} disbanded: {}", code, reason);
        GroupDisbanded {
            code: code.clone(),
            reason: reason.to_string(),
            recipients,
        }
    }
}
