//! End-to-end group lifecycle: invite, message exchange, removal and
//! reinvitation across three members sharing an in-memory relay.

mod common;

use std::sync::Arc;

use common::{chat_rumor, create_group, relays, Member};
use garrison_core::network::MemoryRelay;

/// Three-member exchange: creator invites A, then B; everyone reads
/// everyone else's messages with the right sender identity.
#[tokio::test]
async fn three_member_group_exchange() {
    let network = Arc::new(MemoryRelay::new());
    let creator = Member::new(&network);
    let member_a = Member::new(&network);
    let member_b = Member::new(&network);

    let group = create_group(&creator, "ops").await;
    assert_eq!(group.epoch().await, 0);
    assert_eq!(group.member_count().await, 1);

    // A publishes a key package and gets invited.
    member_a.watch_gifts().await;
    network.set_inbox_relays(member_a.identity(), relays());
    let a_kp_event = member_a.publish_key_package().await;

    let recipients = group.invite_by_key_package_event(&a_kp_event).await.unwrap();
    assert_eq!(recipients, vec![member_a.identity()]);
    assert_eq!(group.epoch().await, 1);
    assert_eq!(group.member_count().await, 2);

    // A joins from the welcome.
    let invites = member_a.receive_invites().await;
    assert_eq!(invites.len(), 1);
    let a_group = member_a
        .client
        .join_group_from_welcome(&invites[0], None)
        .await
        .unwrap();
    member_a.watch_group(a_group.group_id_hex()).await;
    assert_eq!(a_group.epoch().await, 1);
    assert_eq!(a_group.member_count().await, 2);

    // Creator speaks; A decodes with the right author.
    group.send_rumor(&chat_rumor(&creator, "hello A")).await.unwrap();
    let outcome = a_group.ingest(&member_a.drain_group_feed().await).await.unwrap();
    assert_eq!(outcome.application_rumors.len(), 1);
    assert_eq!(outcome.application_rumors[0].content, "hello A");
    assert_eq!(outcome.application_rumors[0].pubkey, creator.identity());
    assert!(outcome.unreadable.is_empty());

    // B publishes a key package and gets invited.
    member_b.watch_gifts().await;
    network.set_inbox_relays(member_b.identity(), relays());
    let b_kp_event = member_b.publish_key_package().await;
    group.invite_by_key_package_event(&b_kp_event).await.unwrap();

    // A catches up with the commit that added B.
    let outcome = a_group.ingest(&member_a.drain_group_feed().await).await.unwrap();
    assert_eq!(outcome.applied_commits.len(), 1);
    assert_eq!(a_group.epoch().await, 2);
    assert_eq!(a_group.member_count().await, 3);

    // B joins.
    let invites = member_b.receive_invites().await;
    assert_eq!(invites.len(), 1);
    let b_group = member_b
        .client
        .join_group_from_welcome(&invites[0], None)
        .await
        .unwrap();
    member_b.watch_group(b_group.group_id_hex()).await;
    assert_eq!(b_group.epoch().await, 2);
    assert_eq!(b_group.member_count().await, 3);

    // Creator broadcasts; both A and B decode it.
    group.send_rumor(&chat_rumor(&creator, "broadcast")).await.unwrap();
    for (member, handle) in [(&member_a, &a_group), (&member_b, &b_group)] {
        let outcome = handle.ingest(&member.drain_group_feed().await).await.unwrap();
        assert_eq!(outcome.application_rumors.len(), 1);
        assert_eq!(outcome.application_rumors[0].content, "broadcast");
    }

    // A speaks; creator and B decode it with A's identity.
    a_group.send_rumor(&chat_rumor(&member_a, "from A")).await.unwrap();
    for (member, handle) in [(&creator, &group), (&member_b, &b_group)] {
        let outcome = handle.ingest(&member.drain_group_feed().await).await.unwrap();
        let from_a: Vec<_> = outcome
            .application_rumors
            .iter()
            .filter(|rumor| rumor.content == "from A")
            .collect();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].pubkey, member_a.identity());
    }
}

/// Removing a member revokes decryption for everything after the next
/// path-refreshing commit.
#[tokio::test]
async fn removal_revokes_decryption() {
    let network = Arc::new(MemoryRelay::new());
    let creator = Member::new(&network);
    let member_a = Member::new(&network);
    let member_b = Member::new(&network);

    let group = create_group(&creator, "purge").await;

    // A is invited, joins, and starts following the group.
    member_a.watch_gifts().await;
    network.set_inbox_relays(member_a.identity(), relays());
    let a_kp = member_a.publish_key_package().await;
    group.invite_by_key_package_event(&a_kp).await.unwrap();
    let a_group = member_a
        .client
        .join_group_from_welcome(&member_a.receive_invites().await[0], None)
        .await
        .unwrap();
    member_a.watch_group(a_group.group_id_hex()).await;

    // Then B.
    member_b.watch_gifts().await;
    network.set_inbox_relays(member_b.identity(), relays());
    let b_kp = member_b.publish_key_package().await;
    group.invite_by_key_package_event(&b_kp).await.unwrap();
    let b_group = member_b
        .client
        .join_group_from_welcome(&member_b.receive_invites().await[0], None)
        .await
        .unwrap();
    member_b.watch_group(b_group.group_id_hex()).await;

    // A only knows epoch 1; catch it up before the removal.
    a_group.ingest(&member_a.drain_group_feed().await).await.unwrap();
    assert_eq!(a_group.member_count().await, 3);

    // Remove A via an extra proposal folded into the commit, then force
    // a path update with an empty commit.
    use garrison_core::facade::ProposalAction;
    group
        .commit(vec![ProposalAction::Remove(member_a.identity())])
        .await
        .unwrap();
    group.commit(vec![]).await.unwrap();
    assert_eq!(group.member_count().await, 2);

    let after_removal = group
        .send_rumor(&chat_rumor(&creator, "after removal"))
        .await
        .unwrap();

    // B follows along and reads the message.
    let outcome = b_group.ingest(&member_b.drain_group_feed().await).await.unwrap();
    assert_eq!(outcome.applied_commits.len(), 2);
    assert_eq!(outcome.application_rumors.len(), 1);
    assert_eq!(outcome.application_rumors[0].content, "after removal");

    // A sees zero application rumors; the message is unreadable to it.
    let outcome = a_group.ingest(&member_a.drain_group_feed().await).await.unwrap();
    assert!(outcome.application_rumors.is_empty());
    assert!(outcome
        .unreadable
        .iter()
        .any(|event| event.id == after_removal.id));
}

/// A removed member can be reinvited with a fresh key package.
#[tokio::test]
async fn reinvitation_after_removal() {
    let network = Arc::new(MemoryRelay::new());
    let creator = Member::new(&network);
    let member_a = Member::new(&network);

    let group = create_group(&creator, "second-chance").await;

    member_a.watch_gifts().await;
    network.set_inbox_relays(member_a.identity(), relays());
    let kp = member_a.publish_key_package().await;
    group.invite_by_key_package_event(&kp).await.unwrap();

    let first_invite = member_a.receive_invites().await.remove(0);
    member_a
        .client
        .join_group_from_welcome(&first_invite, None)
        .await
        .unwrap();
    member_a.inbox.mark_as_read(&first_invite.id).unwrap();

    // Remove A.
    use garrison_core::facade::ProposalAction;
    group.propose(ProposalAction::Remove(member_a.identity())).await.unwrap();
    group.commit(vec![]).await.unwrap();
    assert_eq!(group.member_count().await, 1);

    // A generates a fresh key package and is invited again.
    let new_kp = member_a.publish_key_package().await;
    group.invite_by_key_package_event(&new_kp).await.unwrap();

    let invites = member_a.receive_invites().await;
    assert_eq!(invites.len(), 1);
    let rejoined = member_a
        .client
        .join_group_from_welcome(&invites[0], None)
        .await
        .unwrap();
    member_a.watch_group(rejoined.group_id_hex()).await;
    assert_eq!(rejoined.member_count().await, 2);

    // A reads messages again.
    group.send_rumor(&chat_rumor(&creator, "welcome back")).await.unwrap();
    let outcome = rejoined
        .ingest(&member_a.drain_group_feed().await)
        .await
        .unwrap();
    assert_eq!(outcome.application_rumors.len(), 1);
    assert_eq!(outcome.application_rumors[0].content, "welcome back");
}

/// When inbox relay discovery yields nothing, welcomes fall back to the
/// group's own relay set.
#[tokio::test]
async fn welcome_relay_fallback() {
    let network = Arc::new(MemoryRelay::new());
    let creator = Member::new(&network);
    let member_a = Member::new(&network);

    let group = create_group(&creator, "fallback").await;

    // No inbox relays registered for A.
    member_a.watch_gifts().await;
    let kp = member_a.publish_key_package().await;
    group.invite_by_key_package_event(&kp).await.unwrap();

    // The gift wrap still arrives, via the group relay.
    let invites = member_a.receive_invites().await;
    assert_eq!(invites.len(), 1);
    let joined = member_a
        .client
        .join_group_from_welcome(&invites[0], None)
        .await
        .unwrap();
    assert_eq!(joined.member_count().await, 2);
}
