//! Relay-side state machine.
//!
//! The hub owns every piece of shared relay state (connected peers, the local
//! roster, groups, chat) and turns each incoming message into the deliveries
//! it causes. It does no I/O: the server feeds it events from one loop and
//! writes out whatever comes back, so every mutation and the broadcast it
//! produces happen in one step.
//!
//! Relay-path transfers are tracked from `transferMeta` until completion or
//! abort, so a departing sender, recipient or group member cancels them.

use crate::chat::ChatRelay;
use crate::clock::Clock;
use crate::group::{
    GroupCode, GroupDisbanded, GroupError, GroupManager, JoinWindowScheduler, MemberRemoved,
};
use crate::protocol::{
    ChunkFrame, ClientMessage, ErrorBody, ErrorCode, ReplyPayload, RequestId, ServerMessage,
};
use crate::roster::{RosterSnapshot, RosterStore, Scope};
use crate::signal::{Delivery, Outgoing, SignalSwitch};
use crate::transfer::{FileId, FileMeta, REASON_CHANNEL_CLOSED};
use crate::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Abort reason when a transfer's group membership ends.
pub const REASON_MEMBERSHIP_ENDED: &str = "membershipEnded";

/// A relay-path transfer between `transferMeta` and its end. Fan-out sends
/// one file id to several targets, so the target is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransferKey {
    from: PeerId,
    target: PeerId,
    file_id: FileId,
}

pub struct Hub<S: JoinWindowScheduler> {
    clock: Arc<dyn Clock>,
    switch: SignalSwitch,
    local: RosterStore,
    groups: GroupManager<S>,
    chat: ChatRelay,
    /// Open relay transfers and the group each was sent in.
    transfers: HashMap<TransferKey, Option<GroupCode>>,
}

impl<S: JoinWindowScheduler> Hub<S> {
    pub fn new(clock: Arc<dyn Clock>, scheduler: S) -> Self {
        Self {
            groups: GroupManager::new(Arc::clone(&clock), scheduler),
            clock,
            switch: SignalSwitch::new(),
            local: RosterStore::new(),
            chat: ChatRelay::default(),
            transfers: HashMap::new(),
        }
    }

    pub fn with_join_window_limits(mut self, default: Duration, max: Duration) -> Self {
        self.groups = self.groups.with_join_window_limits(default, max);
        self
    }

    pub fn with_chat(mut self, chat: ChatRelay) -> Self {
        self.chat = chat;
        self
    }

    pub fn groups(&self) -> &GroupManager<S> {
        &self.groups
    }

    pub fn local_roster(&self) -> RosterSnapshot {
        self.local.snapshot(&Scope::Local)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.switch.is_connected(peer)
    }

    /// Number of relay-path transfers in flight.
    pub fn open_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// A new connection was assigned `peer`.
    pub fn connect(&mut self, peer: PeerId) -> Vec<Delivery> {
        self.switch.connect(peer);
        vec![Delivery::one(peer, ServerMessage::Welcome { peer_id: peer })]
    }

    /// Remove a peer from every scope and group, cascading host departures.
    pub fn disconnect(&mut self, peer: PeerId) -> Vec<Delivery> {
        if !self.switch.disconnect(&peer) {
            return Vec::new();
        }

        let mut out =
            self.cancel_transfers(REASON_CHANNEL_CLOSED, |key, _| key.from == peer || key.target == peer);
        out.extend(
            self.local
                .on_disconnect(&peer)
                .into_iter()
                .filter_map(roster_delivery),
        );

        for removed in self.groups.on_disconnect(peer) {
            out.extend(self.membership_ended(removed));
        }
        out
    }

    /// Apply one control message from `from`.
    pub fn handle(&mut self, from: PeerId, message: ClientMessage) -> Vec<Delivery> {
        debug!("{} from {}", message.kind(), from.short());

        match message {
            ClientMessage::EnterLocal { display_name } => {
                let snapshot = self.local.enter(Scope::Local, from, display_name);
                roster_delivery(snapshot).into_iter().collect()
            }

            ClientMessage::LeaveLocal => self
                .local
                .leave(&Scope::Local, &from)
                .and_then(roster_delivery)
                .into_iter()
                .collect(),

            ClientMessage::CreateGroup {
                request_id,
                display_name,
                join_window_minutes,
            } => match self.groups.create(from, display_name, join_window_minutes) {
                Ok(created) => {
                    let reply = ServerMessage::ok(
                        request_id,
                        ReplyPayload::GroupCreated {
                            code: created.code,
                            host_id: created.host_id,
                            open_share: created.open_share,
                        },
                    );
                    let mut out = vec![Delivery::one(from, reply)];
                    out.extend(roster_delivery(created.roster));
                    out
                }
                Err(e) => vec![error_reply(from, request_id, &e)],
            },

            ClientMessage::JoinGroup {
                request_id,
                display_name,
                code,
            } => match self.groups.join(&code, from, display_name) {
                Ok(joined) => {
                    let reply = ServerMessage::ok(
                        request_id,
                        ReplyPayload::GroupJoined {
                            code: joined.code,
                            host_id: joined.host_id,
                            open_share: joined.open_share,
                        },
                    );
                    let mut out = vec![Delivery::one(from, reply)];
                    out.extend(roster_delivery(joined.roster));
                    out
                }
                Err(e) => vec![error_reply(from, request_id, &e)],
            },

            ClientMessage::LeaveGroup { code } => match self.groups.remove_member(&code, from) {
                Ok(removed) => {
                    let mut out = self.cancel_transfers(REASON_MEMBERSHIP_ENDED, |key, room| {
                        room.as_ref() == Some(&code) && (key.from == from || key.target == from)
                    });
                    out.extend(self.membership_ended(removed));
                    out
                }
                Err(e) => {
                    debug!("leaveGroup ignored: {}", e);
                    Vec::new()
                }
            },

            ClientMessage::SetOpenShare { code, value } => {
                match self.groups.set_open_share(&code, from, value) {
                    Ok(changed) => vec![Delivery::message(
                        changed.recipients,
                        ServerMessage::OpenShareChanged {
                            code: changed.code,
                            value: changed.value,
                        },
                    )],
                    Err(e) => {
                        ignore_silently(&e);
                        Vec::new()
                    }
                }
            }

            ClientMessage::DisbandGroup { code } => match self.groups.disband(&code, from) {
                Ok(disbanded) => self.membership_ended(MemberRemoved::Disbanded(disbanded)),
                Err(e) => {
                    ignore_silently(&e);
                    Vec::new()
                }
            },

            ClientMessage::Signal { to, kind, payload } => {
                self.switch.relay(from, to, kind, payload).into_iter().collect()
            }

            ClientMessage::Chat {
                scope,
                display_name,
                text,
            } => {
                let members = self.scope_members(&scope);
                let now = self.clock.now_ms();
                match self
                    .chat
                    .compose(scope, from, display_name, text, members, now)
                {
                    Ok(delivery) => vec![delivery],
                    Err(e) => {
                        debug!("Chat from {} dropped: {}", from.short(), e);
                        Vec::new()
                    }
                }
            }

            ClientMessage::TransferMeta {
                request_id,
                target_id,
                room,
                file_id,
                name,
                size,
                mime_type,
                chunk_bytes,
            } => {
                if let Some(code) = &room {
                    if !self.groups.may_send(code, &from, &target_id) {
                        debug!(
                            "Transfer {} -> {} in {} refused: sharing restricted",
                            from.short(),
                            target_id.short(),
                            code
                        );
                        let body = ErrorBody::new(
                            ErrorCode::SharingRestricted,
                            "Only the host can share files with everyone in this group",
                        );
                        return request_id
                            .map(|id| Delivery::one(from, ServerMessage::error(id, body)))
                            .into_iter()
                            .collect();
                    }
                }
                let key = TransferKey {
                    from,
                    target: target_id,
                    file_id: file_id.clone(),
                };
                self.transfers.insert(key, room);
                let meta = FileMeta {
                    file_id,
                    name,
                    size,
                    mime_type,
                    chunk_bytes,
                };
                let forwarded = ServerMessage::transfer_meta(from, meta);
                self.forward_acked(from, target_id, Outgoing::Message(forwarded), request_id)
            }

            ClientMessage::TransferComplete {
                request_id,
                target_id,
                file_id,
            } => {
                let key = TransferKey {
                    from,
                    target: target_id,
                    file_id,
                };
                if self.transfers.remove(&key).is_none() {
                    return transfer_closed(from, request_id, &key.file_id);
                }
                let forwarded = ServerMessage::TransferComplete {
                    from,
                    file_id: key.file_id,
                };
                self.forward_acked(from, target_id, Outgoing::Message(forwarded), request_id)
            }

            ClientMessage::TransferAbort {
                target_id,
                file_id,
                reason,
            } => {
                self.transfers.remove(&TransferKey {
                    from,
                    target: target_id,
                    file_id: file_id.clone(),
                });
                let forwarded = ServerMessage::TransferAborted {
                    from,
                    file_id,
                    reason,
                };
                self.switch
                    .forward(target_id, Outgoing::Message(forwarded))
                    .into_iter()
                    .collect()
            }
        }
    }

    /// Forward a relay-path chunk to its target, stamped with the sender.
    ///
    /// The chunk's acknowledgement rides along as a receipt, answered once
    /// the chunk has been written to the target. Chunks for transfers the
    /// relay is not tracking are refused.
    pub fn handle_chunk(&mut self, from: PeerId, frame: ChunkFrame) -> Vec<Delivery> {
        let target = frame.peer;
        let request_id = frame.request_id;
        let key = TransferKey {
            from,
            target,
            file_id: frame.file_id.clone(),
        };
        if !self.transfers.contains_key(&key) {
            return transfer_closed(from, request_id, &key.file_id);
        }

        let forwarded = ChunkFrame {
            peer: from,
            request_id: None,
            ..frame
        };
        match (self.switch.forward(target, Outgoing::Chunk(forwarded)), request_id) {
            (Some(delivery), Some(id)) => vec![delivery.with_receipt(from, id)],
            (Some(delivery), None) => vec![delivery],
            // Dropped for an offline target, acked like any other relay drop
            (None, Some(id)) => vec![Delivery::one(from, ServerMessage::ok(id, ReplyPayload::Accepted))],
            (None, None) => Vec::new(),
        }
    }

    /// Drop every tracked transfer matching `pred` and tell its recipient.
    fn cancel_transfers<P>(&mut self, reason: &str, mut pred: P) -> Vec<Delivery>
    where
        P: FnMut(&TransferKey, &Option<GroupCode>) -> bool,
    {
        let keys: Vec<TransferKey> = self
            .transfers
            .iter()
            .filter(|(key, room)| pred(*key, *room))
            .map(|(key, _)| key.clone())
            .collect();

        let mut out = Vec::new();
        for key in keys {
            self.transfers.remove(&key);
            debug!(
                "Cancelling relay transfer {} {} -> {}: {}",
                key.file_id,
                key.from.short(),
                key.target.short(),
                reason
            );
            let aborted = ServerMessage::TransferAborted {
                from: key.from,
                file_id: key.file_id,
                reason: reason.to_string(),
            };
            out.extend(self.switch.forward(key.target, Outgoing::Message(aborted)));
        }
        out
    }

    /// Deliveries for a membership change, cancelling a disbanded group's
    /// transfers first.
    fn membership_ended(&mut self, removed: MemberRemoved) -> Vec<Delivery> {
        let mut out = match &removed {
            MemberRemoved::Disbanded(disbanded) => {
                let code = disbanded.code.clone();
                self.cancel_transfers(REASON_MEMBERSHIP_ENDED, |_, room| room.as_ref() == Some(&code))
            }
            MemberRemoved::Left(_) => Vec::new(),
        };
        out.extend(member_removed_delivery(removed));
        out
    }

    /// The join-window timer for `code` fired.
    pub fn join_window_elapsed(&mut self, code: &GroupCode) -> Vec<Delivery> {
        match self.groups.close_join_window(code) {
            Some(closed) => vec![Delivery::message(
                closed.recipients,
                ServerMessage::JoinClosed { code: closed.code },
            )],
            None => {
                debug!("Ignoring stale join-window timer for {}", code);
                Vec::new()
            }
        }
    }

    fn forward_acked(
        &self,
        from: PeerId,
        to: PeerId,
        message: Outgoing,
        request_id: Option<RequestId>,
    ) -> Vec<Delivery> {
        let mut out: Vec<Delivery> = self.switch.forward(to, message).into_iter().collect();
        if let Some(id) = request_id {
            out.push(Delivery::one(from, ServerMessage::ok(id, ReplyPayload::Accepted)));
        }
        out
    }

    fn scope_members(&self, scope: &Scope) -> Vec<PeerId> {
        match scope {
            Scope::Local => self.local.members(scope),
            Scope::Group(code) => self
                .groups
                .get(code)
                .map(|g| g.member_ids())
                .unwrap_or_default(),
        }
    }
}

/// Roster broadcast for a snapshot, unless nobody is left to receive it.
fn roster_delivery(snapshot: RosterSnapshot) -> Option<Delivery> {
    let recipients = snapshot.recipients();
    if recipients.is_empty() {
        return None;
    }
    Some(Delivery::message(
        recipients,
        ServerMessage::Roster {
            scope: snapshot.scope,
            entries: snapshot.entries,
        },
    ))
}

fn disbanded_delivery(disbanded: GroupDisbanded) -> Delivery {
    Delivery::message(
        disbanded.recipients,
        ServerMessage::GroupDisbanded {
            code: disbanded.code,
            reason: disbanded.reason,
        },
    )
}

fn member_removed_delivery(removed: MemberRemoved) -> Option<Delivery> {
    match removed {
        MemberRemoved::Left(snapshot) => roster_delivery(snapshot),
        MemberRemoved::Disbanded(disbanded) => {
            info!(
                "Group {} disbanded ({}), notifying {} member(s)",
                disbanded.code,
                disbanded.reason,
                disbanded.recipients.len()
            );
            Some(disbanded_delivery(disbanded))
        }
    }
}

/// Refusal for a chunk or completion the relay is not tracking.
fn transfer_closed(to: PeerId, request_id: Option<RequestId>, file_id: &FileId) -> Vec<Delivery> {
    debug!("Refusing frame for untracked transfer {} from {}", file_id, to.short());
    let body = ErrorBody::new(ErrorCode::TransferClosed, "Transfer is not open on the relay");
    request_id
        .map(|id| Delivery::one(to, ServerMessage::error(id, body)))
        .into_iter()
        .collect()
}

fn error_reply(to: PeerId, request_id: RequestId, err: &GroupError) -> Delivery {
    Delivery::one(to, ServerMessage::error(request_id, ErrorBody::from(err)))
}

/// Host-only operations from non-hosts are dropped without a reply.
fn ignore_silently(err: &GroupError) {
    match err {
        GroupError::NotHost(peer) => debug!("Ignoring host-only request from {}", peer.short()),
        other => debug!("Request ignored: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::group::tests::RecordingScheduler;
    use crate::group::{REASON_HOST_DISBANDED, REASON_HOST_LEFT};
    use crate::protocol::{ReplyResult, SignalKind};
    use crate::roster::RosterEntry;
    use crate::signal::Receipt;

    struct Fixture {
        hub: Hub<RecordingScheduler>,
        clock: ManualClock,
        next_request: RequestId,
    }

    fn host() -> PeerId {
        PeerId::from(0x100)
    }

    fn alice() -> PeerId {
        PeerId::from(0x200)
    }

    fn bob() -> PeerId {
        PeerId::from(0x300)
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new(1_700_000_000_000);
            let hub = Hub::new(Arc::new(clock.clone()), RecordingScheduler::default());
            let mut fixture = Self {
                hub,
                clock,
                next_request: 1,
            };
            for peer in [host(), alice(), bob()] {
                fixture.hub.connect(peer);
            }
            fixture
        }

        fn request_id(&mut self) -> RequestId {
            self.next_request += 1;
            self.next_request
        }

        fn create(&mut self, minutes: Option<u64>) -> GroupCode {
            let request_id = self.request_id();
            let out = self.hub.handle(
                host(),
                ClientMessage::CreateGroup {
                    request_id,
                    display_name: "Host".into(),
                    join_window_minutes: minutes,
                },
            );
            match reply_for(&out, host()) {
                ReplyResult::Ok(ReplyPayload::GroupCreated { code, .. }) => code,
                other => panic!("Expected groupCreated, got {:?}", other),
            }
        }

        fn join(&mut self, peer: PeerId, code: &GroupCode) -> Vec<Delivery> {
            let request_id = self.request_id();
            self.hub.handle(
                peer,
                ClientMessage::JoinGroup {
                    request_id,
                    display_name: format!("peer-{}", peer.short()),
                    code: code.clone(),
                },
            )
        }
    }

    fn messages_for(out: &[Delivery], peer: PeerId) -> Vec<ServerMessage> {
        out.iter()
            .filter(|d| d.to.contains(&peer))
            .filter_map(|d| match &d.message {
                Outgoing::Message(m) => Some(m.clone()),
                Outgoing::Chunk(_) => None,
            })
            .collect()
    }

    fn reply_for(out: &[Delivery], peer: PeerId) -> ReplyResult {
        messages_for(out, peer)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::Reply { result, .. } => Some(result),
                _ => None,
            })
            .expect("reply")
    }

    fn roster_for(out: &[Delivery], peer: PeerId) -> Option<Vec<RosterEntry>> {
        messages_for(out, peer).into_iter().find_map(|m| match m {
            ServerMessage::Roster { entries, .. } => Some(entries),
            _ => None,
        })
    }

    #[test]
    fn test_connect_sends_welcome() {
        let mut hub = Hub::new(Arc::new(ManualClock::new(0)), RecordingScheduler::default());
        let out = hub.connect(alice());
        assert_eq!(
            messages_for(&out, alice()),
            vec![ServerMessage::Welcome { peer_id: alice() }]
        );
        assert!(hub.is_connected(&alice()));
    }

    #[test]
    fn test_local_roster_enter_leave() {
        let mut f = Fixture::new();
        f.hub.handle(alice(), ClientMessage::EnterLocal { display_name: "Alice".into() });
        let out = f.hub.handle(bob(), ClientMessage::EnterLocal { display_name: "Bob".into() });

        assert_eq!(roster_for(&out, alice()).unwrap().len(), 2);
        assert_eq!(roster_for(&out, bob()).unwrap().len(), 2);

        let out = f.hub.handle(alice(), ClientMessage::LeaveLocal);
        assert_eq!(roster_for(&out, bob()).unwrap().len(), 1);
        assert!(roster_for(&out, alice()).is_none());

        // Leaving twice broadcasts nothing
        assert!(f.hub.handle(alice(), ClientMessage::LeaveLocal).is_empty());
    }

    #[test]
    fn test_scenario_join_within_window() {
        let mut f = Fixture::new();
        let code = f.create(Some(10));
        f.clock.advance(Duration::from_secs(5 * 60));

        let out = f.join(alice(), &code);
        match reply_for(&out, alice()) {
            ReplyResult::Ok(ReplyPayload::GroupJoined { host_id, open_share, .. }) => {
                assert_eq!(host_id, host());
                assert!(!open_share);
            }
            other => panic!("Expected groupJoined, got {:?}", other),
        }
        assert_eq!(roster_for(&out, host()).unwrap().len(), 2);
        assert_eq!(roster_for(&out, alice()).unwrap().len(), 2);
    }

    #[test]
    fn test_join_errors_are_distinct() {
        let mut f = Fixture::new();
        let out = f.join(alice(), &GroupCode::from("999999"));
        assert!(matches!(
            reply_for(&out, alice()),
            ReplyResult::Error(ErrorBody { code: ErrorCode::GroupNotFound, .. })
        ));

        let code = f.create(Some(1));
        f.clock.advance(Duration::from_secs(61));
        let out = f.join(alice(), &code);
        assert!(matches!(
            reply_for(&out, alice()),
            ReplyResult::Error(ErrorBody { code: ErrorCode::JoinWindowClosed, .. })
        ));
        // The failure goes to the requester alone
        assert!(messages_for(&out, host()).is_empty());
    }

    #[test]
    fn test_scenario_non_host_open_share_is_silent() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);

        let out = f.hub.handle(
            alice(),
            ClientMessage::SetOpenShare {
                code: code.clone(),
                value: true,
            },
        );
        assert!(out.is_empty());
        assert!(!f.hub.groups().get(&code).unwrap().open_share());

        let out = f.hub.handle(host(), ClientMessage::SetOpenShare { code: code.clone(), value: true });
        assert_eq!(
            messages_for(&out, alice()),
            vec![ServerMessage::OpenShareChanged { code, value: true }]
        );
    }

    #[test]
    fn test_non_host_disband_is_silent() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);

        assert!(f.hub.handle(alice(), ClientMessage::DisbandGroup { code: code.clone() }).is_empty());
        assert_eq!(f.hub.groups().get(&code).unwrap().members().len(), 2);

        let out = f.hub.handle(host(), ClientMessage::DisbandGroup { code: code.clone() });
        assert_eq!(
            messages_for(&out, alice()),
            vec![ServerMessage::GroupDisbanded {
                code,
                reason: REASON_HOST_DISBANDED.into()
            }]
        );
    }

    #[test]
    fn test_scenario_host_disconnect_disbands() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);
        f.join(bob(), &code);

        let out = f.hub.disconnect(host());
        let expected = ServerMessage::GroupDisbanded {
            code: code.clone(),
            reason: REASON_HOST_LEFT.into(),
        };
        assert_eq!(messages_for(&out, alice()), vec![expected.clone()]);
        assert_eq!(messages_for(&out, bob()), vec![expected]);
        assert!(messages_for(&out, host()).is_empty());

        let out = f.join(alice(), &code);
        assert!(matches!(
            reply_for(&out, alice()),
            ReplyResult::Error(ErrorBody { code: ErrorCode::GroupNotFound, .. })
        ));
    }

    #[test]
    fn test_member_leave_updates_roster() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);

        let out = f.hub.handle(alice(), ClientMessage::LeaveGroup { code: code.clone() });
        let entries = roster_for(&out, host()).unwrap();
        assert_eq!(entries, vec![RosterEntry::new(host(), "Host")]);
    }

    #[test]
    fn test_join_closed_broadcast_and_stale_timer() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);

        f.clock.advance(Duration::from_secs(10 * 60 + 1));
        let out = f.hub.join_window_elapsed(&code);
        assert_eq!(
            messages_for(&out, alice()),
            vec![ServerMessage::JoinClosed { code: code.clone() }]
        );

        f.hub.handle(host(), ClientMessage::DisbandGroup { code: code.clone() });
        assert!(f.hub.join_window_elapsed(&code).is_empty());
    }

    #[test]
    fn test_signal_forwarding() {
        let mut f = Fixture::new();
        let payload = serde_json::json!({"candidate": "c"});
        let out = f.hub.handle(
            alice(),
            ClientMessage::Signal {
                to: bob(),
                kind: SignalKind::Candidate,
                payload: payload.clone(),
            },
        );
        assert_eq!(
            messages_for(&out, bob()),
            vec![ServerMessage::SignalReceived {
                from: alice(),
                kind: SignalKind::Candidate,
                payload,
            }]
        );

        f.hub.disconnect(bob());
        let out = f.hub.handle(
            alice(),
            ClientMessage::Signal {
                to: bob(),
                kind: SignalKind::Offer,
                payload: serde_json::Value::Null,
            },
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_group_chat_reaches_members_only() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);

        let out = f.hub.handle(
            alice(),
            ClientMessage::Chat {
                scope: Scope::Group(code.clone()),
                display_name: "Alice".into(),
                text: "hello".into(),
            },
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].to.contains(&host()) && out[0].to.contains(&alice()));
        assert!(!out[0].to.contains(&bob()));
        assert!(matches!(
            &out[0].message,
            Outgoing::Message(ServerMessage::ChatReceived { timestamp, .. }) if *timestamp == 1_700_000_000_000
        ));

        // Outsiders cannot post into the group
        let out = f.hub.handle(
            bob(),
            ClientMessage::Chat {
                scope: Scope::Group(code),
                display_name: "Bob".into(),
                text: "let me in".into(),
            },
        );
        assert!(out.is_empty());
    }

    fn transfer_meta(target: PeerId, room: Option<GroupCode>, request_id: RequestId) -> ClientMessage {
        ClientMessage::TransferMeta {
            request_id: Some(request_id),
            target_id: target,
            room,
            file_id: FileId::from("f1"),
            name: "a.txt".into(),
            size: 3,
            mime_type: "text/plain".into(),
            chunk_bytes: 1024,
        }
    }

    #[test]
    fn test_sharing_restricted_until_open_share() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);
        f.join(bob(), &code);

        let out = f.hub.handle(alice(), transfer_meta(bob(), Some(code.clone()), 50));
        assert!(messages_for(&out, bob()).is_empty());
        assert!(matches!(
            reply_for(&out, alice()),
            ReplyResult::Error(ErrorBody { code: ErrorCode::SharingRestricted, .. })
        ));

        // Members may always send to the host
        let out = f.hub.handle(alice(), transfer_meta(host(), Some(code.clone()), 51));
        assert_eq!(reply_for(&out, alice()), ReplyResult::Ok(ReplyPayload::Accepted));
        assert!(matches!(
            messages_for(&out, host()).as_slice(),
            [ServerMessage::TransferMeta { from, .. }] if *from == alice()
        ));

        f.hub.handle(host(), ClientMessage::SetOpenShare { code: code.clone(), value: true });
        let out = f.hub.handle(alice(), transfer_meta(bob(), Some(code), 52));
        assert_eq!(
            messages_for(&out, bob()),
            vec![ServerMessage::TransferMeta {
                from: alice(),
                file_id: FileId::from("f1"),
                name: "a.txt".into(),
                size: 3,
                mime_type: "text/plain".into(),
                chunk_bytes: 1024,
            }]
        );
    }

    fn chunk(target: PeerId, seq: u32, request_id: Option<RequestId>) -> ChunkFrame {
        ChunkFrame {
            peer: target,
            file_id: FileId::from("f1"),
            seq,
            request_id,
            data: b"abc".to_vec(),
        }
    }

    fn aborted_for(out: &[Delivery], peer: PeerId) -> Vec<String> {
        messages_for(out, peer)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::TransferAborted { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chunk_forwarded_with_sender_and_receipt() {
        let mut f = Fixture::new();
        f.hub.handle(alice(), transfer_meta(bob(), None, 10));
        let out = f.hub.handle_chunk(alice(), chunk(bob(), 0, Some(77)));

        // The ack waits for the write to bob instead of being sent now
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, vec![bob()]);
        assert_eq!(
            out[0].receipt,
            Some(Receipt {
                to: alice(),
                request_id: 77
            })
        );
        match &out[0].message {
            Outgoing::Chunk(forwarded) => {
                assert_eq!(forwarded.peer, alice());
                assert_eq!(forwarded.request_id, None);
                assert_eq!(forwarded.data, b"abc");
            }
            other => panic!("Expected chunk, got {:?}", other),
        }
        assert!(messages_for(&out, alice()).is_empty());
    }

    #[test]
    fn test_chunk_without_meta_is_refused() {
        let mut f = Fixture::new();
        let out = f.hub.handle_chunk(alice(), chunk(bob(), 0, Some(5)));
        assert!(messages_for(&out, bob()).is_empty());
        assert!(matches!(
            reply_for(&out, alice()),
            ReplyResult::Error(ErrorBody { code: ErrorCode::TransferClosed, .. })
        ));

        // Completing closes the transfer; later chunks are refused too
        f.hub.handle(alice(), transfer_meta(bob(), None, 6));
        let out = f.hub.handle(
            alice(),
            ClientMessage::TransferComplete {
                request_id: Some(7),
                target_id: bob(),
                file_id: FileId::from("f1"),
            },
        );
        assert_eq!(reply_for(&out, alice()), ReplyResult::Ok(ReplyPayload::Accepted));
        assert_eq!(f.hub.open_transfers(), 0);
        let out = f.hub.handle_chunk(alice(), chunk(bob(), 1, Some(8)));
        assert!(matches!(
            reply_for(&out, alice()),
            ReplyResult::Error(ErrorBody { code: ErrorCode::TransferClosed, .. })
        ));
    }

    #[test]
    fn test_same_file_to_two_targets_tracked_separately() {
        let mut f = Fixture::new();
        f.hub.handle(host(), transfer_meta(alice(), None, 10));
        f.hub.handle(host(), transfer_meta(bob(), None, 11));
        assert_eq!(f.hub.open_transfers(), 2);

        let out = f.hub.handle_chunk(host(), chunk(alice(), 0, Some(12)));
        assert_eq!(out[0].to, vec![alice()]);
        let out = f.hub.handle_chunk(host(), chunk(bob(), 0, Some(13)));
        assert_eq!(out[0].to, vec![bob()]);

        // Bob leaving cancels only his leg
        let out = f.hub.disconnect(bob());
        assert!(aborted_for(&out, alice()).is_empty());
        assert_eq!(f.hub.open_transfers(), 1);
    }

    #[test]
    fn test_sender_disconnect_aborts_relay_transfer() {
        let mut f = Fixture::new();
        f.hub.handle(alice(), transfer_meta(bob(), None, 10));
        f.hub.handle_chunk(alice(), chunk(bob(), 0, Some(11)));
        assert_eq!(f.hub.open_transfers(), 1);

        let out = f.hub.disconnect(alice());
        assert_eq!(
            messages_for(&out, bob()),
            vec![ServerMessage::TransferAborted {
                from: alice(),
                file_id: FileId::from("f1"),
                reason: REASON_CHANNEL_CLOSED.into(),
            }]
        );
        assert_eq!(f.hub.open_transfers(), 0);
    }

    #[test]
    fn test_recipient_disconnect_forgets_transfer() {
        let mut f = Fixture::new();
        f.hub.handle(alice(), transfer_meta(bob(), None, 10));
        let out = f.hub.disconnect(bob());
        assert!(aborted_for(&out, alice()).is_empty());
        assert_eq!(f.hub.open_transfers(), 0);
    }

    #[test]
    fn test_leaving_group_aborts_room_transfers() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);
        f.hub.handle(alice(), transfer_meta(host(), Some(code.clone()), 10));
        // A direct transfer outside the group survives the leave
        f.hub.handle(
            alice(),
            ClientMessage::TransferMeta {
                request_id: None,
                target_id: bob(),
                room: None,
                file_id: FileId::from("f2"),
                name: "b.txt".into(),
                size: 1,
                mime_type: "text/plain".into(),
                chunk_bytes: 1024,
            },
        );

        let out = f.hub.handle(alice(), ClientMessage::LeaveGroup { code });
        assert_eq!(aborted_for(&out, host()), vec![REASON_MEMBERSHIP_ENDED.to_string()]);
        assert!(aborted_for(&out, bob()).is_empty());
        assert_eq!(f.hub.open_transfers(), 1);
    }

    #[test]
    fn test_disband_aborts_room_transfers() {
        let mut f = Fixture::new();
        let code = f.create(None);
        f.join(alice(), &code);
        f.hub.handle(host(), transfer_meta(alice(), Some(code.clone()), 10));

        let out = f.hub.handle(host(), ClientMessage::DisbandGroup { code });
        assert_eq!(aborted_for(&out, alice()), vec![REASON_MEMBERSHIP_ENDED.to_string()]);
        assert!(messages_for(&out, alice())
            .iter()
            .any(|m| matches!(m, ServerMessage::GroupDisbanded { .. })));
        assert_eq!(f.hub.open_transfers(), 0);
    }

    #[test]
    fn test_abort_from_sender_forgets_transfer() {
        let mut f = Fixture::new();
        f.hub.handle(alice(), transfer_meta(bob(), None, 10));
        f.hub.handle(
            alice(),
            ClientMessage::TransferAbort {
                target_id: bob(),
                file_id: FileId::from("f1"),
                reason: "cancelled".into(),
            },
        );
        assert_eq!(f.hub.open_transfers(), 0);
        assert!(aborted_for(&f.hub.disconnect(alice()), bob()).is_empty());
    }

    #[test]
    fn test_disconnect_cleans_local_and_groups() {
        let mut f = Fixture::new();
        f.hub.handle(alice(), ClientMessage::EnterLocal { display_name: "Alice".into() });
        f.hub.handle(bob(), ClientMessage::EnterLocal { display_name: "Bob".into() });
        let code = f.create(None);
        f.join(alice(), &code);

        let out = f.hub.disconnect(alice());
        assert_eq!(roster_for(&out, bob()).unwrap().len(), 1);
        assert_eq!(roster_for(&out, host()).unwrap().len(), 1);
        assert!(!f.hub.is_connected(&alice()));

        // Second disconnect is a no-op
        assert!(f.hub.disconnect(alice()).is_empty());
    }
}
