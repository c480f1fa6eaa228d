//! DHT behaviour across a small, fully connected mesh.

use std::time::Duration;

use peermesh::dht::key_id;
use peermesh::proximity::closest_of;
use peermesh::{
    DhtConfig, GetOptions, MemoryNetwork, Mesh, MeshConfig, MeshError, MeshEvent, PeerId, PutOptions,
    UpdateOptions, wait_for_status,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn id(first: u8) -> PeerId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    PeerId::from_bytes(bytes)
}

/// Three nodes, every pair linked, auto-discovery off so nothing else moves.
async fn triangle() -> (MemoryNetwork, Vec<Mesh>) {
    triangle_with(DhtConfig::default()).await
}

async fn triangle_with(dht: DhtConfig) -> (MemoryNetwork, Vec<Mesh>) {
    let network = MemoryNetwork::new();
    let config = MeshConfig {
        auto_discovery: false,
        ..MeshConfig::default()
    };
    let nodes: Vec<Mesh> = [0x10, 0x20, 0x30]
        .into_iter()
        .map(|first| {
            let peer = id(first);
            let mesh = Mesh::builder()
                .peer_id(peer.to_hex())
                .config(config.clone())
                .dht_config(dht.clone())
                .signaling(network.signaling(peer))
                .channels(network.channels(peer))
                .build()
                .expect("build failed");
            network.attach(&mesh).expect("attach failed");
            mesh
        })
        .collect();
    for mesh in &nodes {
        mesh.connect().await.expect("connect failed");
    }
    for (from, to) in [(1, 0), (2, 0), (2, 1)] {
        nodes[from]
            .connect_to_peer(&nodes[to].peer_id().to_hex())
            .await
            .expect("dial failed");
    }
    for mesh in &nodes {
        wait_for_status(mesh, TEST_TIMEOUT, |s| s.connected_count == 2)
            .await
            .expect("triangle did not form");
    }
    (network, nodes)
}

async fn next_change(events: &mut mpsc::Receiver<MeshEvent>, key: &str) -> (Vec<u8>, u64, PeerId) {
    loop {
        let event = timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for DHT change")
            .expect("event stream closed");
        if let MeshEvent::DhtValueChanged {
            key: changed,
            value,
            version,
            issuer,
        } = event
            && changed == key
        {
            return (value, version, issuer);
        }
    }
}

#[tokio::test]
async fn put_on_one_node_is_readable_everywhere() {
    let (_network, nodes) = triangle().await;
    assert!(nodes[0].dht_put("alpha", b"one".to_vec(), PutOptions::default()).await.unwrap());

    for mesh in &nodes {
        let value = mesh.dht_get("alpha", GetOptions::default()).await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"one"[..]));
    }

    let stats = nodes[2].dht_stats().await.unwrap();
    assert!(stats.enabled);
    assert_eq!(stats.replication_factor, 3);
}

#[tokio::test]
async fn put_from_node_without_copy_supersedes_replica() {
    let single = DhtConfig {
        replication_factor: 1,
        ..DhtConfig::default()
    };
    let (_network, nodes) = triangle_with(single).await;
    let key = "contested";
    let closest = closest_of(&key_id(key), nodes.iter().map(Mesh::peer_id))[0];
    let holder = nodes.iter().find(|m| m.peer_id() == closest).expect("holder is a node");
    let others: Vec<&Mesh> = nodes.iter().filter(|m| m.peer_id() != closest).collect();

    // only the holder keeps these two versions
    assert!(holder.dht_put(key, b"old1".to_vec(), PutOptions::default()).await.unwrap());
    assert!(holder.dht_put(key, b"old2".to_vec(), PutOptions::default()).await.unwrap());

    assert!(others[0].dht_put(key, b"new".to_vec(), PutOptions::default()).await.unwrap());

    // the store reaches the holder asynchronously
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let value = holder.dht_get(key, GetOptions::default()).await.unwrap();
        if value.as_deref() == Some(&b"new"[..]) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "holder still has {value:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let value = others[1].dht_get(key, GetOptions::default()).await.unwrap();
    assert_eq!(value.as_deref(), Some(&b"new"[..]));
}

#[tokio::test]
async fn missing_key_resolves_to_none() {
    let (_network, nodes) = triangle().await;
    let value = nodes[1].dht_get("nobody-wrote-this", GetOptions::default()).await.unwrap();
    assert!(value.is_none());
    assert_eq!(nodes[1].dht_stats().await.unwrap().pending_lookups, 0);
}

#[tokio::test]
async fn values_expire_after_ttl() {
    let (_network, nodes) = triangle().await;
    let options = PutOptions {
        ttl: Some(Duration::from_millis(150)),
    };
    nodes[0].dht_put("ephemeral", b"soon gone".to_vec(), options).await.unwrap();
    assert!(nodes[0].dht_get("ephemeral", GetOptions::default()).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    for mesh in &nodes {
        assert!(mesh.dht_get("ephemeral", GetOptions::default()).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn updates_are_versioned_and_reach_subscribers() {
    let (_network, nodes) = triangle().await;
    let writer = &nodes[0];
    let mut events = nodes[1].events().await.unwrap();

    assert!(nodes[1].dht_subscribe("counter").await.unwrap().is_none());
    assert_eq!(nodes[1].dht_stats().await.unwrap().subscriptions, 1);

    let explicit = UpdateOptions {
        version: Some(5),
        ..UpdateOptions::default()
    };
    assert!(writer.dht_update("counter", b"five".to_vec(), explicit).await.unwrap());
    let (value, version, issuer) = next_change(&mut events, "counter").await;
    assert_eq!(value, b"five".to_vec());
    assert_eq!(version, 5);
    assert_eq!(issuer, writer.peer_id());

    let stale = UpdateOptions {
        version: Some(3),
        ..UpdateOptions::default()
    };
    assert!(!writer.dht_update("counter", b"three".to_vec(), stale).await.unwrap());

    assert!(writer
        .dht_update("counter", b"six".to_vec(), UpdateOptions::default())
        .await
        .unwrap());
    let (value, version, _) = next_change(&mut events, "counter").await;
    assert_eq!(value, b"six".to_vec());
    assert_eq!(version, 6);

    let read = nodes[2].dht_get("counter", GetOptions::default()).await.unwrap();
    assert_eq!(read.as_deref(), Some(&b"six"[..]));

    nodes[1].dht_unsubscribe("counter").await.unwrap();
    assert_eq!(nodes[1].dht_stats().await.unwrap().subscriptions, 0);
}

#[tokio::test]
async fn oversized_values_are_rejected() {
    let (_network, nodes) = triangle().await;
    let err = nodes[0]
        .dht_put("big", vec![0u8; 64 * 1024 + 1], PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MeshError>(),
        Some(MeshError::MessageTooLarge { .. })
    ));
}
