//! Integration tests for the cluster client: failover, selection
//! preference, pool exhaustion and the unauthenticated info probe.

mod common;

use std::time::{Duration, Instant};

use common::{MockServer, Reply, encoded, err_payload};
use pretty_assertions::assert_eq;
use rmpv::Value;
use siridb_client::constant::{
    ERR_SERVER, RES_AUTH_SUCCESS, RES_INFO, RES_INSERT, RES_QUERY, RequestType,
};
use siridb_client::{Cluster, Error, Opts, Server, server_info};

const TIMEOUT: Duration = Duration::from_secs(5);

fn opts_for(servers: Vec<Server>) -> Opts {
    Opts {
        username: "iris".to_string(),
        password: "siri".to_string(),
        dbname: "dbtest".to_string(),
        servers,
        keepalive: false,
        connect_timeout: Duration::from_secs(2),
        inactive_time: Duration::from_millis(200),
        ..Opts::default()
    }
}

fn answering(marker: &'static str) -> MockServer {
    MockServer::start(RES_AUTH_SUCCESS, move |ty, _| {
        if ty == RequestType::Insert as u8 {
            Reply::Respond(RES_INSERT, encoded(&Value::from(marker)))
        } else {
            Reply::Respond(RES_QUERY, encoded(&Value::from(marker)))
        }
    })
}

fn failing() -> MockServer {
    MockServer::start(RES_AUTH_SUCCESS, |_, _| {
        Reply::Respond(ERR_SERVER, err_payload("server is paused"))
    })
}

#[tokio::test]
async fn failover_demotes_and_rearms_a_failing_server() {
    let bad = failing();
    let good = answering("good");
    let cluster = Cluster::new(opts_for(vec![
        Server::new("127.0.0.1", bad.port()),
        Server::new("127.0.0.1", good.port()),
    ]))
    .expect("cluster");
    cluster.connect(None).await.expect("connect");

    // keep querying until the failing server has been picked once; every
    // call must still come back from the healthy one
    let mut bad_was_hit = false;
    for _ in 0..100 {
        let result = cluster
            .query("select * from 'series-001'", None, TIMEOUT)
            .await
            .expect("query");
        assert_eq!(result, Value::from("good"));
        if bad.request_count() >= 1 {
            bad_was_hit = true;
            break;
        }
    }
    assert!(bad_was_hit, "the failing server was never selected");

    // after the inactive cool-down the demoted server is selectable again
    let hits_before = bad.request_count();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut rearmed = false;
    for _ in 0..100 {
        let result = cluster
            .query("select * from 'series-001'", None, TIMEOUT)
            .await
            .expect("query");
        assert_eq!(result, Value::from("good"));
        if bad.request_count() > hits_before {
            rearmed = true;
            break;
        }
    }
    assert!(rearmed, "the demoted server never became available again");

    cluster.close().await;
    assert!(cluster.is_closed());
}

#[tokio::test]
async fn backup_is_not_used_while_a_regular_server_answers() {
    let regular = answering("regular");
    let backup = answering("backup");
    let cluster = Cluster::new(opts_for(vec![
        Server::new("127.0.0.1", regular.port()),
        Server::new("127.0.0.1", backup.port()).backup(),
    ]))
    .expect("cluster");
    cluster.connect(None).await.expect("connect");

    for _ in 0..20 {
        let result = cluster
            .query("select * from 'series-001'", None, TIMEOUT)
            .await
            .expect("query");
        assert_eq!(result, Value::from("regular"));
    }
    assert_eq!(backup.request_count(), 0);
    cluster.close().await;
}

#[tokio::test]
async fn backup_serves_when_it_is_the_only_server_left() {
    let backup = answering("backup");
    let cluster = Cluster::new(opts_for(vec![
        Server::new("127.0.0.1", common::unreachable_port()),
        Server::new("127.0.0.1", backup.port()).backup(),
    ]))
    .expect("cluster");
    cluster.connect(None).await.expect("connect");
    assert!(cluster.connected());

    let result = cluster
        .query("select * from 'series-001'", None, TIMEOUT)
        .await
        .expect("query");
    assert_eq!(result, Value::from("backup"));
    cluster.close().await;
}

#[tokio::test]
async fn exhausted_pool_times_out_with_a_pool_error() {
    let cluster = Cluster::new(opts_for(vec![Server::new(
        "127.0.0.1",
        common::unreachable_port(),
    )]))
    .expect("cluster");
    assert!(cluster.connect(None).await.is_err());
    assert!(!cluster.connected());

    let started = Instant::now();
    match cluster
        .query("select * from 'series-001'", None, Duration::from_millis(500))
        .await
    {
        Err(Error::PoolError(msg)) => assert_eq!(msg, "No available connections found"),
        other => panic!("expected PoolError, got {other:?}"),
    }
    // one two-second poll happens before the deadline check cuts in
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "returned too early: {elapsed:?}");
    cluster.close().await;
}

#[tokio::test]
async fn insert_goes_to_an_available_server() {
    let server = answering("inserted");
    let cluster = Cluster::new(opts_for(vec![Server::new("127.0.0.1", server.port())]))
        .expect("cluster");
    cluster.connect(None).await.expect("connect");

    let points = Value::Map(vec![(
        Value::from("series-001"),
        Value::Array(vec![Value::Array(vec![
            Value::from(1_471_254_705u32),
            Value::from(12),
        ])]),
    )]);
    let result = cluster.insert(&points, TIMEOUT).await.expect("insert");
    assert_eq!(result, Value::from("inserted"));
    cluster.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_sticky() {
    let server = answering("x");
    let cluster = Cluster::new(opts_for(vec![Server::new("127.0.0.1", server.port())]))
        .expect("cluster");
    cluster.connect(None).await.expect("connect");
    cluster.close().await;
    cluster.close().await;
    assert!(cluster.is_closed());
    assert!(!cluster.connected());
}

#[tokio::test]
async fn info_probe_needs_no_auth() {
    let server = MockServer::start(RES_AUTH_SUCCESS, |ty, _| {
        assert_eq!(ty, RequestType::Info as u8);
        Reply::Respond(
            RES_INFO,
            encoded(&Value::Map(vec![(
                Value::from("version"),
                Value::from("2.0.51"),
            )])),
        )
    });
    let info = server_info("127.0.0.1", server.port(), TIMEOUT)
        .await
        .expect("server info");
    let Value::Map(entries) = info else {
        panic!("expected a map");
    };
    assert_eq!(entries[0].1.as_str(), Some("2.0.51"));
}
