//! Peer selection, failover and the peer cache.

use s2s_client::{ClientConfig, ClientError, SiteToSiteClient};
use s2s_peers::{Peer, PeerAddress, PeerStatus, PeerStatusCache};
use std::time::Instant;

use crate::harness::{self, MockBehavior, MockNifi};

#[tokio::test]
async fn test_fails_over_to_live_seed() {
    harness::init_tracing();
    let nifi = MockNifi::start(MockBehavior::default()).await;
    let dead = harness::dead_url().await;
    let client = SiteToSiteClient::new(harness::http_config(vec![dead, nifi.url()])).unwrap();

    let mut tx = client.create_transaction().await.unwrap();
    assert_eq!(tx.peer().http_port, Some(nifi.port));
    tx.send(&harness::packet(1)).await.unwrap();
    tx.confirm().await.unwrap();
    tx.complete().await.unwrap();
    assert_eq!(nifi.state.received().len(), 1);
}

#[tokio::test]
async fn test_all_peers_down_is_exhausted() {
    let urls = vec![harness::dead_url().await, harness::dead_url().await];
    let client = SiteToSiteClient::new(harness::http_config(urls)).unwrap();

    let err = client.create_transaction().await.unwrap_err();
    match err {
        ClientError::PeerExhausted { last: Some(last) } => assert!(last.is_peer_failure()),
        other => panic!("expected PeerExhausted, got {other}"),
    }
    assert!(client.tracker().peers().iter().all(|p| p.has_failed()));
}

#[tokio::test]
async fn test_rejected_begin_fails_over() {
    let rejecting = MockNifi::start(MockBehavior {
        reject_begin: true,
        ..MockBehavior::default()
    })
    .await;
    let accepting = MockNifi::start(MockBehavior::default()).await;
    let client = SiteToSiteClient::new(harness::http_config(vec![
        rejecting.url(),
        accepting.url(),
    ]))
    .unwrap();

    let tx = client.create_transaction().await.unwrap();
    assert_eq!(tx.peer().http_port, Some(accepting.port));
    assert_eq!(accepting.state.begun(), 1);
}

#[tokio::test]
async fn test_missing_port_identifier_is_config_error() {
    let nifi = MockNifi::start(MockBehavior::default()).await;
    let config = ClientConfig {
        port_identifier: None,
        ..harness::http_config(vec![nifi.url()])
    };
    let client = SiteToSiteClient::new(config).unwrap();

    let err = client.create_transaction().await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)), "got {err}");
    assert_eq!(nifi.state.begun(), 0);
}

#[tokio::test]
async fn test_refresh_records_load_and_persists_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("peers.json");
    let nifi = MockNifi::start(MockBehavior {
        flow_file_count: 7,
        ..MockBehavior::default()
    })
    .await;

    let config = ClientConfig {
        peer_cache_path: Some(cache_path.to_string_lossy().into_owned()),
        ..harness::http_config(vec![nifi.url()])
    };
    let client = SiteToSiteClient::new(config).unwrap();
    let peers = client.get_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].flow_file_count, 7);

    let tracked = client.tracker().peers();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].flow_file_count, 7);
    assert!(cache_path.exists());

    // A second client starts from the cache; its dead seed is added but the
    // cached peer still answers.
    let config = ClientConfig {
        peer_cache_path: Some(cache_path.to_string_lossy().into_owned()),
        ..harness::http_config(vec![harness::dead_url().await])
    };
    let restarted = SiteToSiteClient::new(config).unwrap();
    let tx = restarted.create_transaction().await.unwrap();
    assert_eq!(tx.peer().http_port, Some(nifi.port));
}

#[tokio::test]
async fn test_cached_peers_keep_configured_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("peers.json");
    let nifi = MockNifi::start(MockBehavior::default()).await;

    // The cache only knows a peer that has since gone away.
    let dead_port = harness::dead_port().await;
    let stale = PeerStatus::new(
        vec![Peer::new(PeerAddress::new("127.0.0.1", Some(dead_port), None, false), 0)],
        Instant::now(),
    );
    PeerStatusCache::new(&cache_path).save(&stale).unwrap();

    let config = ClientConfig {
        peer_cache_path: Some(cache_path.to_string_lossy().into_owned()),
        ..harness::http_config(vec![nifi.url()])
    };
    let client = SiteToSiteClient::new(config).unwrap();
    assert_eq!(client.tracker().peers().len(), 2);

    let tx = client.create_transaction().await.unwrap();
    assert_eq!(tx.peer().http_port, Some(nifi.port));
}

#[tokio::test]
async fn test_failed_refresh_waits_for_next_interval() {
    let nifi = MockNifi::start(MockBehavior {
        reject_peers: true,
        ..MockBehavior::default()
    })
    .await;
    let client = SiteToSiteClient::new(harness::http_config(vec![nifi.url()])).unwrap();

    client.create_transaction().await.unwrap();
    client.create_transaction().await.unwrap();
    client.create_transaction().await.unwrap();
    assert_eq!(nifi.state.peer_requests(), 1);
    assert_eq!(nifi.state.begun(), 3);
}
