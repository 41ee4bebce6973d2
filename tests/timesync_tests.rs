//! Clock-sync negotiation and master election, driven through scripted
//! links without the engine loop.

mod common;

use bandgame_core::domain::models::{CoreEvent, SyncStatus};
use bandgame_core::domain::settings::SyncFailurePolicy;
use bandgame_core::infrastructure::manager::{BandManager, ManagerNotice};
use bandgame_core::infrastructure::transport::{Attribute, AttributeSet, CommandStatus};
use common::{full_caps, MockLink, RecordedOp};
use std::sync::Arc;
use tokio::sync::mpsc;

fn new_manager(
    policy: SyncFailurePolicy,
) -> (
    Arc<BandManager>,
    mpsc::UnboundedReceiver<CoreEvent>,
    mpsc::UnboundedReceiver<ManagerNotice>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    (
        BandManager::new(event_tx, notice_tx, policy),
        event_rx,
        notice_rx,
    )
}

#[test]
fn first_peer_runs_the_full_sequence_and_claims_master() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let link = MockLink::auto(full_caps());
    manager.notice_peer(1, "band-1", link.clone());

    assert_eq!(manager.master(), Some(1));
    let device = manager.device(1).expect("device registered");
    assert_eq!(device.sync_status(), SyncStatus::Master);

    let token = manager.group_token();
    assert_eq!(
        link.sync_ops(),
        vec![
            RecordedOp::SetNotify(Attribute::TimesyncCounter, true),
            RecordedOp::Write(Attribute::TimesyncMode, vec![0]),
            RecordedOp::Read(Attribute::TimesyncCounter),
            RecordedOp::Write(Attribute::TimesyncGroup, token.to_vec()),
            RecordedOp::Write(Attribute::TimesyncMode, vec![2]),
        ]
    );
}

#[test]
fn second_peer_becomes_slave_and_syncs_on_first_notification() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let link1 = MockLink::auto(full_caps());
    let link2 = MockLink::auto(full_caps());
    manager.notice_peer(1, "band-1", link1);
    manager.notice_peer(2, "band-2", link2.clone());

    assert_eq!(manager.master(), Some(1));
    let device = manager.device(2).expect("device registered");
    assert_eq!(device.sync_status(), SyncStatus::Negotiating);
    assert_eq!(
        link2.sync_ops().last(),
        Some(&RecordedOp::Write(Attribute::TimesyncMode, vec![1]))
    );

    // The first unsolicited counter notification marks the slave synced.
    link2.notify(Attribute::TimesyncCounter, &[9]);
    assert_eq!(device.sync_status(), SyncStatus::Synced);

    // Further notifications keep it that way.
    link2.notify(Attribute::TimesyncCounter, &[10]);
    assert_eq!(device.sync_status(), SyncStatus::Synced);
}

#[test]
fn master_loss_reelects_with_fresh_token_and_no_resubscribe() {
    let (manager, _events, mut notices) = new_manager(SyncFailurePolicy::Halt);
    let link1 = MockLink::auto(full_caps());
    let link2 = MockLink::auto(full_caps());
    manager.notice_peer(1, "band-1", link1.clone());
    manager.notice_peer(2, "band-2", link2.clone());
    link2.notify(Attribute::TimesyncCounter, &[1]);

    let old_token = manager.group_token();
    let ops_before = link2.ops().len();

    link1.disconnect();

    // Exactly one re-election: the surviving peer now holds the role.
    assert_eq!(manager.master(), Some(2));
    let device = manager.device(2).expect("device registered");
    assert_eq!(device.sync_status(), SyncStatus::Master);

    let new_token = manager.group_token();
    assert_ne!(new_token, old_token);

    // Renegotiation resumes after the subscribe step.
    let restart_ops: Vec<_> = link2.ops()[ops_before..].to_vec();
    assert_eq!(
        restart_ops,
        vec![
            RecordedOp::Write(Attribute::TimesyncMode, vec![0]),
            RecordedOp::Read(Attribute::TimesyncCounter),
            RecordedOp::Write(Attribute::TimesyncGroup, new_token.to_vec()),
            RecordedOp::Write(Attribute::TimesyncMode, vec![2]),
        ]
    );

    // The loss itself was reported.
    let mut lost = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let ManagerNotice::BandLost(peer) = notice {
            lost.push(peer);
        }
    }
    assert_eq!(lost, vec![1]);
}

#[test]
fn peer_without_sync_attributes_is_permanently_skipped() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let bare = MockLink::auto(AttributeSet::new().with(Attribute::InertiaData));
    manager.notice_peer(1, "band-1", bare.clone());

    let device = manager.device(1).expect("still a valid band");
    assert_eq!(device.sync_status(), SyncStatus::Unsupported);
    assert_eq!(manager.master(), None);
    assert!(bare.sync_ops().is_empty());

    // A capable peer still gets the role, and losing it leaves the
    // unsupported peer untouched.
    let capable = MockLink::auto(full_caps());
    manager.notice_peer(2, "band-2", capable.clone());
    assert_eq!(manager.master(), Some(2));

    capable.disconnect();
    assert_eq!(manager.master(), None);
    assert_eq!(device.sync_status(), SyncStatus::Unsupported);
    assert!(bare.sync_ops().is_empty());
}

#[test]
fn peer_without_inertia_data_is_rejected() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let link = MockLink::auto(AttributeSet::new().with(Attribute::TimesyncMode));
    manager.notice_peer(7, "not-a-band", link);
    assert!(manager.device(7).is_none());
}

#[test]
fn failed_step_parks_the_peer_under_halt_policy() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let link = MockLink::manual(full_caps());
    manager.notice_peer(1, "band-1", link.clone());

    // Zero-offset read queued ahead of the sync sequence.
    link.complete_next(CommandStatus::Success);
    // Subscribe step fails: the peer parks where it is.
    link.complete_next(CommandStatus::Failure);

    assert_eq!(link.pending_count(), 0);
    let device = manager.device(1).expect("device registered");
    assert_eq!(device.sync_status(), SyncStatus::Negotiating);
    assert_eq!(manager.master(), None);
}

#[test]
fn failed_step_reruns_the_sequence_under_restart_policy() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Restart);
    let link = MockLink::manual(full_caps());
    manager.notice_peer(1, "band-1", link.clone());

    link.complete_next(CommandStatus::Success); // zero-offset read
    link.complete_next(CommandStatus::Failure); // subscribe fails
    link.complete_next(CommandStatus::Success); // retried subscribe

    assert_eq!(
        link.sync_ops(),
        vec![
            RecordedOp::SetNotify(Attribute::TimesyncCounter, true),
            RecordedOp::SetNotify(Attribute::TimesyncCounter, true),
            RecordedOp::Write(Attribute::TimesyncMode, vec![0]),
        ]
    );
}

#[test]
fn stale_completion_after_restart_is_a_no_op() {
    let (manager, _events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let link1 = MockLink::auto(full_caps());
    manager.notice_peer(1, "band-1", link1.clone());
    assert_eq!(manager.master(), Some(1));

    let link2 = MockLink::manual(full_caps());
    manager.notice_peer(2, "band-2", link2.clone());
    link2.complete_next(CommandStatus::Success); // zero-offset read
    link2.complete_next(CommandStatus::Success); // subscribe
    link2.complete_next(CommandStatus::Success); // mode disable
    // The counter read is now outstanding.

    let ops_before = link2.ops().len();
    link1.disconnect();

    // The restart re-queued work behind the in-flight read; completing
    // that read must not advance the restarted sequence.
    link2.complete_next(CommandStatus::Success); // stale counter read
    link2.complete_next(CommandStatus::Success); // mode disable
    link2.complete_next(CommandStatus::Success); // fresh counter read
    link2.complete_next(CommandStatus::Success); // group write
    link2.complete_next(CommandStatus::Success); // master mode write

    assert_eq!(manager.master(), Some(2));
    let device = manager.device(2).expect("device registered");
    assert_eq!(device.sync_status(), SyncStatus::Master);

    let token = manager.group_token();
    let restart_ops: Vec<_> = link2.ops()[ops_before..].to_vec();
    assert_eq!(
        restart_ops,
        vec![
            RecordedOp::Write(Attribute::TimesyncMode, vec![0]),
            RecordedOp::Read(Attribute::TimesyncCounter),
            RecordedOp::Write(Attribute::TimesyncGroup, token.to_vec()),
            RecordedOp::Write(Attribute::TimesyncMode, vec![2]),
        ]
    );
}

#[test]
fn sync_status_changes_are_reported() {
    let (manager, mut events, _notices) = new_manager(SyncFailurePolicy::Halt);
    let link = MockLink::auto(full_caps());
    manager.notice_peer(1, "band-1", link);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::SyncStatusChanged { peer: 1, status } = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses.last(), Some(&SyncStatus::Master));
    assert!(statuses.contains(&SyncStatus::Negotiating));
}
