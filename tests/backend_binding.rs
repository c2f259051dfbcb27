//! Backend bind/kick: local path, forwarded path, and record upkeep.

mod common;

use common::{wait_until, Cluster, Event};
use pitaya_cluster::session::cache::{binding_key, BindingRecord, ClusterCache};
use pitaya_cluster::{CloseReason, Error, Server};
use std::collections::HashMap;

async fn stored_record(cluster: &Cluster, uid: &str) -> Option<BindingRecord> {
    cluster
        .cache
        .get(&binding_key(uid))
        .await
        .unwrap()
        .map(|bytes| BindingRecord::decode(&bytes).unwrap())
}

#[tokio::test]
async fn local_backend_bind_stores_flushes_and_fans_out() {
    let cluster = Cluster::new();
    let f1 = cluster.spawn(Server::frontend("f1", "connector")).await;
    let b1 = cluster.spawn(Server::backend("r1", "room")).await;

    let session = b1.pool.create_session();
    session.set_uid("u1").unwrap();
    session
        .bind_backend("room", "r1", &HashMap::new())
        .await
        .unwrap();

    // Indexed under the uid and visible in the cluster record.
    assert_eq!(b1.pool.session_by_uid("u1").unwrap().id(), session.id());
    let record = stored_record(&cluster, "u1").await.expect("record stored");
    assert_eq!(record.backends.get("room").map(String::as_str), Some("r1"));

    // Fork reaches our own type; the per-type notify reaches everyone.
    wait_until("room fork listener", || {
        b1.listener.count(|e| {
            matches!(e, Event::BindBackend { uid, server_id, .. } if uid == "u1" && server_id == "r1")
        }) == 1
    })
    .await;
    wait_until("connector bound-backend listener", || {
        f1.listener.count(|e| {
            matches!(e, Event::BoundBackend { uid, server_id, .. } if uid == "u1" && server_id == "r1")
        }) == 1
    })
    .await;
}

#[tokio::test]
async fn second_backend_bind_for_same_uid_is_rejected() {
    let cluster = Cluster::new();
    cluster.spawn(Server::frontend("f1", "connector")).await;
    let b1 = cluster.spawn(Server::backend("r1", "room")).await;

    let first = b1.pool.create_session();
    first.set_uid("u1").unwrap();
    first
        .bind_backend("room", "r1", &HashMap::new())
        .await
        .unwrap();

    let second = b1.pool.create_session();
    second.set_uid("u1").unwrap();
    let err = second
        .bind_backend("room", "r1", &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionAlreadyBound));
}

#[tokio::test]
async fn remote_backend_bind_forwards_to_target() {
    let cluster = Cluster::new();
    let f1 = cluster.spawn(Server::frontend("f1", "connector")).await;
    let b2 = cluster.spawn(Server::backend("r2", "room")).await;

    let session = f1.pool.create_session();
    session.bind("u2", &HashMap::new()).await.unwrap();
    let sessions_before = f1.pool.session_count();

    session
        .bind_backend("room", "r2", &HashMap::new())
        .await
        .unwrap();

    // The target backend materializes the binding.
    wait_until("backend session stored", || {
        b2.pool.session_by_uid("u2").is_some()
    })
    .await;
    common::settle().await;
    let record = stored_record(&cluster, "u2").await.expect("record stored");
    assert_eq!(record.backends.get("room").map(String::as_str), Some("r2"));
    // The frontend's ownership survives the backend flush.
    assert_eq!(record.frontend_id, "f1");

    // Forwarding mutates nothing locally on the frontend.
    assert_eq!(f1.pool.session_count(), sessions_before);
}

#[tokio::test]
async fn forwarded_bind_with_wrong_target_is_rejected_by_receiver() {
    let cluster = Cluster::new();
    let b1 = cluster.spawn(Server::backend("r1", "room")).await;

    // A message claiming a different backend id must not bind here.
    use pitaya_cluster::protocol::{self, BindBackendMsg, Message, Request};
    let msg = BindBackendMsg {
        uid: "u9".into(),
        btype: "room".into(),
        bid: "r9".into(),
        metadata: HashMap::new(),
    };
    let client = pitaya_cluster::RpcClient::new(
        std::sync::Arc::new(cluster.broker.client()),
        b1.server.clone(),
        std::time::Duration::from_secs(1),
    );
    let request = Request::new(Message::request(
        "session.bind.backend",
        protocol::encode(&msg).unwrap().to_vec(),
    ));
    let response = client.call(&b1.server, &request).await.unwrap();
    assert!(response.is_error());
    assert_eq!(response.error.unwrap().code, "PIT-ILLEGAL-BIND-ID");
    assert!(b1.pool.session_by_uid("u9").is_none());
}

#[tokio::test]
async fn local_backend_kick_clears_binding_and_fans_out() {
    let cluster = Cluster::new();
    let f1 = cluster.spawn(Server::frontend("f1", "connector")).await;
    let b1 = cluster.spawn(Server::backend("r1", "room")).await;

    let session = b1.pool.create_session();
    session.set_uid("u1").unwrap();
    session
        .bind_backend("room", "r1", &HashMap::new())
        .await
        .unwrap();

    session
        .kick_backend("room", "r1", &HashMap::new(), CloseReason::Kicked)
        .await
        .unwrap();

    assert!(b1.pool.session_by_uid("u1").is_none());
    let record = stored_record(&cluster, "u1").await.expect("record kept");
    assert!(record.backends.get("room").is_none());
    wait_until("unbound fan-out", || {
        f1.listener.count(|e| {
            matches!(e, Event::UnboundBackend { uid, .. } if uid == "u1")
        }) == 1
    })
    .await;
}

#[tokio::test]
async fn rebind_backend_kick_skips_fanout() {
    let cluster = Cluster::new();
    let f1 = cluster.spawn(Server::frontend("f1", "connector")).await;
    let b1 = cluster.spawn(Server::backend("r1", "room")).await;

    let session = b1.pool.create_session();
    session.set_uid("u1").unwrap();
    session
        .bind_backend("room", "r1", &HashMap::new())
        .await
        .unwrap();

    session
        .kick_backend("room", "r1", &HashMap::new(), CloseReason::Rebind)
        .await
        .unwrap();

    assert!(b1.pool.session_by_uid("u1").is_none());
    common::settle().await;
    assert_eq!(
        f1.listener
            .count(|e| matches!(e, Event::UnboundBackend { uid, .. } if uid == "u1")),
        0
    );
    // The record keeps the binding; reconciliation happens on next bind.
    let record = stored_record(&cluster, "u1").await.expect("record kept");
    assert_eq!(record.backends.get("room").map(String::as_str), Some("r1"));
}
