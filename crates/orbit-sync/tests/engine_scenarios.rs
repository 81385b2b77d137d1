//! End-to-end engine scenarios over the in-memory record store.

use orbit_core::RecordId;
use orbit_keys::{share_zone_key, ZoneKey};
use orbit_records::{diff, SecretRecord, ZoneManifest};
use orbit_store::{RecordStore, StateStore, StoredRecord, SyncedRecord, WriteOp};
use orbit_sync::CircleStatus;
use orbit_testkit::{seeded_identity, seeded_rng, TestCluster};

/// Drive two devices to a two-member circle: X founds, Y applies, X
/// accepts.
async fn two_member_cluster() -> TestCluster {
    let cluster = TestCluster::new(2);
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    assert_eq!(
        x.engine.join_circle(&zone).await.unwrap(),
        CircleStatus::Member
    );
    assert_eq!(
        y.engine.join_circle(&zone).await.unwrap(),
        CircleStatus::Applying
    );
    x.engine
        .accept_applicants(&zone, vec![y.identity.peer_id])
        .await
        .unwrap();
    y.engine.sync_now(&zone).await.unwrap();
    cluster
}

#[tokio::test]
async fn join_and_accept_reach_generation_two() {
    // X creates a circle (generation 1), Y applies, X accepts the
    // ticket; the resulting circle has generation 2 and members {X, Y}.
    let cluster = two_member_cluster().await;
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    let x_status = x.engine.zone_status(&zone).await.unwrap();
    let y_status = y.engine.zone_status(&zone).await.unwrap();
    assert_eq!(x_status.generation, Some(2));
    assert_eq!(y_status.generation, Some(2));
    assert_eq!(
        y.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::Member
    );

    let circle = x.engine.current_circle(&zone).await.unwrap().unwrap();
    assert!(circle.is_member(&x.identity.peer_id));
    assert!(circle.is_member(&y.identity.peer_id));
}

#[tokio::test]
async fn secrets_flow_between_members() {
    let cluster = two_member_cluster().await;
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    let id = x
        .engine
        .put_secret(&zone, b"wifi-password".to_vec())
        .await
        .unwrap();
    x.engine.sync_now(&zone).await.unwrap();
    y.engine.sync_now(&zone).await.unwrap();

    assert_eq!(
        y.engine.get_secret(&zone, id).await.unwrap(),
        b"wifi-password"
    );
}

#[tokio::test]
async fn removal_triggers_rekey_and_poisons_old_shares() {
    // The zone's key v1 is shared with {X, Y}; X retires. The circle
    // generation increments, Y re-keys, key v2 is shared only with Y,
    // and every v1 share is poisoned.
    let cluster = two_member_cluster().await;
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    let id = x
        .engine
        .put_secret(&zone, b"survivor".to_vec())
        .await
        .unwrap();
    x.engine.sync_now(&zone).await.unwrap();
    y.engine.sync_now(&zone).await.unwrap();

    let before = y.state_store.load_zone(&zone).await.unwrap();
    let v1_epoch = before.share_log.current_epoch();
    let generation_before = y.engine.zone_status(&zone).await.unwrap().generation;

    x.engine.leave_circle(&zone).await.unwrap();
    y.engine.sync_now(&zone).await.unwrap();

    let status = y.engine.zone_status(&zone).await.unwrap();
    assert_eq!(
        status.generation,
        generation_before.map(|generation| generation + 1)
    );

    let after = y.state_store.load_zone(&zone).await.unwrap();
    assert!(after.share_log.current_epoch() > v1_epoch);
    for entry in after.share_log.entries() {
        if entry.share.epoch == v1_epoch {
            assert!(entry.poisoned(), "v1 share must be poisoned after rotation");
        } else {
            // The successor key went only to the remaining member.
            assert_eq!(entry.share.receiver, y.identity.peer_id);
        }
    }

    // Y still reads the secret, now re-encrypted under v2.
    assert_eq!(y.engine.get_secret(&zone, id).await.unwrap(), b"survivor");
}

#[tokio::test]
async fn concurrent_disjoint_puts_converge_with_empty_diff() {
    // Two devices put different secrets in the same zone; both pushes
    // succeed, and after sync their manifests agree.
    let cluster = two_member_cluster().await;
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    let x_id = x.engine.put_secret(&zone, b"from-x".to_vec()).await.unwrap();
    let y_id = y.engine.put_secret(&zone, b"from-y".to_vec()).await.unwrap();
    x.engine.sync_now(&zone).await.unwrap();
    y.engine.sync_now(&zone).await.unwrap();
    x.engine.sync_now(&zone).await.unwrap();
    y.engine.sync_now(&zone).await.unwrap();

    assert!(!x.engine.zone_status(&zone).await.unwrap().stalled);
    assert!(!y.engine.zone_status(&zone).await.unwrap().stalled);

    assert_eq!(x.engine.get_secret(&zone, y_id).await.unwrap(), b"from-y");
    assert_eq!(y.engine.get_secret(&zone, x_id).await.unwrap(), b"from-x");

    let x_snapshot = x.state_store.load_zone(&zone).await.unwrap();
    let y_snapshot = y.state_store.load_zone(&zone).await.unwrap();
    let x_manifest = x_snapshot
        .pending_manifest
        .seal(&zone, 2, x.vault.as_ref())
        .unwrap();
    let y_manifest = y_snapshot
        .pending_manifest
        .seal(&zone, 2, y.vault.as_ref())
        .unwrap();
    assert!(diff(&x_manifest, &y_manifest).is_empty());
    assert_eq!(x_manifest.digest, y_manifest.digest);
}

#[tokio::test]
async fn records_from_outside_the_circle_are_dropped() {
    // The store returns a record wrapped under a key share belonging
    // to a peer not in the circle; the engine drops it and leaves the
    // current manifest untouched.
    let cluster = TestCluster::new(1);
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];

    x.engine.join_circle(&zone).await.unwrap();
    let own_id = x.engine.put_secret(&zone, b"mine".to_vec()).await.unwrap();
    x.engine.sync_now(&zone).await.unwrap();

    let manifest_before = x
        .state_store
        .load_zone(&zone)
        .await
        .unwrap()
        .current_manifest
        .unwrap();

    // An outsider fabricates a key hierarchy and a record, and writes
    // them straight into the store.
    let (mallory, mallory_vault) = seeded_identity(9, "mallory");
    let mut rng = seeded_rng(99);
    let mallory_key = ZoneKey::generate(zone.clone(), 1, &mut rng);
    let mallory_share = share_zone_key(
        &mallory_key,
        mallory_vault.as_ref(),
        &mallory,
        1,
        &mut rng,
    )
    .unwrap();
    let mallory_record = SecretRecord::encrypt(
        b"planted",
        &mallory_key,
        RecordId::new(),
        1,
        &mut rng,
    )
    .unwrap();
    let planted_id = mallory_record.record_id;
    let mallory_manifest = ZoneManifest::build(
        &zone,
        &[mallory_record.clone()],
        2,
        mallory_vault.as_ref(),
    )
    .unwrap();

    let writes = vec![
        WriteOp::Upsert(StoredRecord::write(
            zone.clone(),
            SyncedRecord::KeyShare(mallory_share),
            None,
        )),
        WriteOp::Upsert(StoredRecord::write(
            zone.clone(),
            SyncedRecord::Secret(mallory_record),
            None,
        )),
        WriteOp::Upsert(StoredRecord::write(
            zone.clone(),
            SyncedRecord::Manifest(mallory_manifest),
            None,
        )),
    ];
    assert!(cluster
        .store
        .save(&zone, writes)
        .await
        .unwrap()
        .fully_accepted());

    x.engine.sync_now(&zone).await.unwrap();

    // The planted record never surfaces, and the manifest is unchanged.
    assert!(x.engine.get_secret(&zone, planted_id).await.is_err());
    assert_eq!(x.engine.get_secret(&zone, own_id).await.unwrap(), b"mine");
    let snapshot = x.state_store.load_zone(&zone).await.unwrap();
    let manifest_after = snapshot.current_manifest.unwrap();
    assert_eq!(manifest_after.signer, x.identity.peer_id);
    assert_eq!(manifest_after.digest, manifest_before.digest);
    assert!(!manifest_after.item_exists(&planted_id));
}

#[tokio::test]
async fn racing_founders_resolve_through_the_store_cas() {
    let cluster = TestCluster::new(2);
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    let (x_result, y_result) =
        tokio::join!(x.engine.join_circle(&zone), y.engine.join_circle(&zone));
    let statuses = [x_result.unwrap(), y_result.unwrap()];

    // Exactly one founds; the loser re-fetches and applies instead.
    assert!(statuses.contains(&CircleStatus::Member));
    let appliers = statuses
        .iter()
        .filter(|s| **s == CircleStatus::Applying)
        .count();
    let members = statuses
        .iter()
        .filter(|s| **s == CircleStatus::Member)
        .count();
    assert_eq!(members + appliers, 2);
    assert_eq!(members, 1);
}

#[tokio::test]
async fn pruned_change_history_forces_a_full_refetch() {
    use orbit_store::FetchOutcome;

    let cluster = TestCluster::new(1);
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];

    x.engine.join_circle(&zone).await.unwrap();
    let first = x.engine.put_secret(&zone, b"one".to_vec()).await.unwrap();
    x.engine.sync_now(&zone).await.unwrap();

    // A write the engine has not seen, then a prune: the engine's token
    // now predates retained history.
    let current = match cluster.store.fetch(&zone, None).await.unwrap() {
        FetchOutcome::Changes(set) => set,
        FetchOutcome::TokenExpired => unreachable!(),
    };
    let rewrite = current
        .upserts
        .iter()
        .find(|r| r.name.starts_with("record:"))
        .cloned()
        .unwrap();
    assert!(cluster
        .store
        .save(&zone, vec![WriteOp::Upsert(rewrite)])
        .await
        .unwrap()
        .fully_accepted());
    cluster.store.prune_history(&zone).await.unwrap();

    let second = x.engine.put_secret(&zone, b"two".to_vec()).await.unwrap();
    x.engine.sync_now(&zone).await.unwrap();

    assert_eq!(x.engine.get_secret(&zone, first).await.unwrap(), b"one");
    assert_eq!(x.engine.get_secret(&zone, second).await.unwrap(), b"two");
    assert!(!x.engine.zone_status(&zone).await.unwrap().stalled);
}

#[tokio::test]
async fn status_reflects_membership_lifecycle() {
    let cluster = TestCluster::new(2);
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    assert_eq!(
        y.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::NotInCircle
    );

    x.engine.join_circle(&zone).await.unwrap();
    assert_eq!(
        x.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::Member
    );

    y.engine.join_circle(&zone).await.unwrap();
    assert_eq!(
        y.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::Applying
    );

    x.engine
        .accept_applicants(&zone, vec![y.identity.peer_id])
        .await
        .unwrap();
    y.engine.sync_now(&zone).await.unwrap();
    assert_eq!(
        y.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::Member
    );

    y.engine.leave_circle(&zone).await.unwrap();
    assert_eq!(
        y.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::NotInCircle
    );
}
