//! Runs in its own process so it can own the global metrics recorder.

use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use signal_relay::router::StaleReason;
use signal_relay::{Envelope, PeerHandle, Registry, RoutingError, SignalRouter};

fn peers_online(handle: &PrometheusHandle) -> Option<f64> {
    handle
        .render()
        .lines()
        .find_map(|line| line.strip_prefix("signal_relay_peers_online "))
        .and_then(|value| value.trim().parse().ok())
}

#[test_timeout::tokio_timeout_test(30)]
async fn online_gauge_tracks_stale_eviction() {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .expect("install recorder");
    let router = SignalRouter::new(Registry::new(), Duration::from_millis(50));

    let (alice, _alice_rx) = PeerHandle::channel(4);
    let (bob, bob_rx) = PeerHandle::channel(4);
    router.route(Envelope::register("alice"), &alice).await.unwrap();
    router.route(Envelope::register("bob"), &bob).await.unwrap();
    assert_eq!(peers_online(&metrics), Some(2.0));

    drop(bob_rx);
    let err = router
        .route(Envelope::offer("alice", "bob", "sdp"), &alice)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RoutingError::StaleHandle {
            peer: "bob".into(),
            reason: StaleReason::Closed,
        }
    );
    assert!(router.registry().lookup("bob").is_none());
    assert_eq!(peers_online(&metrics), Some(1.0));

    router.registry().remove("alice");
    assert_eq!(peers_online(&metrics), Some(0.0));
}
