//! The full out-of-band join handshake: a candidate sends its
//! application over the pairing channel, a member accepts it into the
//! circle through the normal store CAS, and the acceptance flows back so
//! the candidate becomes a member without waiting on store propagation.

use orbit_pairing::{MemoryTransportHub, PairingChannel, PairingConfig, PairingPayload};
use orbit_sync::CircleStatus;
use orbit_testkit::TestCluster;
use orbit_trust::ApplicationTicket;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> PairingConfig {
    PairingConfig {
        ack_timeout: Duration::from_millis(50),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        ..PairingConfig::default()
    }
}

#[tokio::test]
async fn pairing_channel_bootstraps_membership() {
    let cluster = TestCluster::new(2);
    let zone = TestCluster::zone();
    let x = &cluster.devices[0];
    let y = &cluster.devices[1];

    // X founds the circle through the store as usual.
    assert_eq!(
        x.engine.join_circle(&zone).await.unwrap(),
        CircleStatus::Member
    );

    let hub = MemoryTransportHub::new();
    let (x_tx, x_rx) = hub.register(x.identity.peer_id).await;
    let (y_tx, y_rx) = hub.register(y.identity.peer_id).await;
    let mut x_channel =
        PairingChannel::new(Arc::new(x_tx), x_rx, x.vault.clone(), test_config()).with_seed(1);
    let mut y_channel =
        PairingChannel::new(Arc::new(y_tx), y_rx, y.vault.clone(), test_config()).with_seed(2);

    // Y applies over the channel instead of the store.
    let ticket = ApplicationTicket::issue(&y.identity, y.vault.as_ref()).unwrap();
    let application = PairingPayload::Application(ticket);

    let (sent, received) = tokio::join!(
        y_channel.send_payload(&x.identity, &application),
        x_channel.recv_payload(Duration::from_secs(2)),
    );
    sent.unwrap();
    let (from, payload) = received.unwrap();
    assert_eq!(from, y.identity.peer_id);
    let ticket = match payload {
        PairingPayload::Application(ticket) => ticket,
        PairingPayload::Acceptance(_) => panic!("expected an application"),
    };

    // X admits and accepts in one circle write, then returns the
    // accepted circle over the channel.
    x.engine.accept_application(&zone, ticket).await.unwrap();
    let accepted = x.engine.current_circle(&zone).await.unwrap().unwrap();
    assert!(accepted.is_member(&y.identity.peer_id));

    let acceptance = PairingPayload::Acceptance(Box::new(accepted));
    let (sent, received) = tokio::join!(
        x_channel.send_payload(&y.identity, &acceptance),
        y_channel.recv_payload(Duration::from_secs(2)),
    );
    sent.unwrap();
    let (_, payload) = received.unwrap();
    let circle = match payload {
        PairingPayload::Acceptance(circle) => *circle,
        PairingPayload::Application(_) => panic!("expected an acceptance"),
    };

    // Y lands the circle through the same CAS discipline and is a
    // member immediately.
    y.engine.install_circle(&zone, circle).await.unwrap();
    assert_eq!(
        y.engine.circle_status(&zone).await.unwrap(),
        CircleStatus::Member
    );

    // The fast path converges with the store path: Y can sync and read
    // records thereafter.
    let id = x.engine.put_secret(&zone, b"shared".to_vec()).await.unwrap();
    x.engine.sync_now(&zone).await.unwrap();
    y.engine.sync_now(&zone).await.unwrap();
    assert_eq!(y.engine.get_secret(&zone, id).await.unwrap(), b"shared");
}
