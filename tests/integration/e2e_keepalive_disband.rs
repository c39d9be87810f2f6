//! End-to-End Integration Harness: keep-alive, reset, and host teardown.
//!
//! The keep-alive interval is tightened from its 19 s production value so
//! the suites can observe pings in test time; everything else runs the real
//! engine against scripted drones on loopback multicast.
//!
//! Ports are per-test so parallel test threads never cross-talk.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use ud_test_utils::{Behavior, DroneScript, MockDrone};
use udrone::protocol::msgtype;
use udrone::{DroneError, Host, HostConfig};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn endpoint(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(239, 6, 6, 6), port)
}

fn host_config(port: u16, idle_interval: Duration) -> HostConfig {
    HostConfig {
        multicast_addr: SocketAddr::V4(endpoint(port)),
        source_addr: Some(Ipv4Addr::LOCALHOST),
        idle_interval,
    }
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_nonempty_groups_emit_keepalive_whois() {
    let port = 47231;
    let d1 = MockDrone::spawn("d1", endpoint(port), DroneScript::default())
        .await
        .unwrap();
    let host = Host::bind(host_config(port, Duration::from_millis(300))).unwrap();
    let group = host.group("QA").unwrap();
    group.assign(1, None, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let pings: Vec<_> = d1
        .received()
        .into_iter()
        .filter(|env| env.msgtype == msgtype::WHOIS && env.to == group.id())
        .collect();
    assert!(
        pings.len() >= 2,
        "expected repeated keep-alive pings, saw {}",
        pings.len()
    );
    // The pings are fire-and-forget; membership must be untouched.
    assert_eq!(group.members().len(), 1);
    assert_eq!(d1.group().as_deref(), Some(group.id()));
}

#[tokio::test]
async fn empty_groups_stay_quiet() {
    let port = 47232;
    let d1 = MockDrone::spawn("d1", endpoint(port), DroneScript::default())
        .await
        .unwrap();
    let host = Host::bind(host_config(port, Duration::from_millis(200))).unwrap();
    let group = host.group("QA").unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    let pings: Vec<_> = d1
        .received()
        .into_iter()
        .filter(|env| env.to == group.id())
        .collect();
    assert!(pings.is_empty(), "memberless groups must not ping");
}

#[tokio::test]
async fn keepalive_mid_request_never_corrupts_the_exchange() {
    let port = 47233;
    let script = DroneScript::default()
        .with_behavior("run", Behavior::DelayedOk(Duration::from_millis(900)));
    let _d1 = MockDrone::spawn("d1", endpoint(port), script).await.unwrap();
    let host = Host::bind(host_config(port, Duration::from_millis(200))).unwrap();
    let group = host.group("QA").unwrap();
    group.assign(1, None, None).await.unwrap();

    // The keep-alive fires while the slow request is in flight; its replies
    // carry a foreign sequence and must be discarded by the exchange filter
    // instead of surfacing as a conflict or a bogus answer.
    let answers = group
        .call("run", None, Duration::from_secs(5), None)
        .await
        .unwrap();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers["d1"].as_ref().unwrap().status().unwrap().code, 0);
}

// ---------------------------------------------------------------------------
// Reset and disband
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_clears_the_group_and_is_idempotent_when_empty() {
    let port = 47234;
    let d1 = MockDrone::spawn("d1", endpoint(port), DroneScript::default())
        .await
        .unwrap();
    let d2 = MockDrone::spawn("d2", endpoint(port), DroneScript::default())
        .await
        .unwrap();
    let host = Host::bind(host_config(port, Duration::from_secs(19))).unwrap();
    let group = host.group("QA").unwrap();
    group.assign(2, None, None).await.unwrap();

    group.reset(None).await.unwrap();
    assert!(group.members().is_empty());
    assert!(d1.group().is_none());
    assert!(d2.group().is_none());

    // Resetting an already-empty group is a no-op, not an error.
    group.reset(None).await.unwrap();
}

#[tokio::test]
async fn reset_reports_stuck_drones_but_still_clears_membership() {
    let port = 47235;
    let stuck = DroneScript {
        ignore_reset: true,
        ..DroneScript::default()
    };
    let _d1 = MockDrone::spawn("d1", endpoint(port), stuck).await.unwrap();
    let host = Host::bind(host_config(port, Duration::from_secs(19))).unwrap();
    let group = host.group("QA").unwrap();
    group.assign(1, None, None).await.unwrap();

    let err = group.reset(None).await.unwrap_err();
    match err {
        DroneError::NotReachable(ids) => assert_eq!(ids, vec!["d1".to_owned()]),
        other => panic!("expected NotReachable, got {other:?}"),
    }
    assert!(
        group.members().is_empty(),
        "membership is cleared even when drones are stuck"
    );
}

#[tokio::test]
async fn host_level_reset_reaches_a_single_drone() {
    let port = 47237;
    let d1 = MockDrone::spawn("d1", endpoint(port), DroneScript::default())
        .await
        .unwrap();
    let host = Host::bind(host_config(port, Duration::from_secs(19))).unwrap();
    let group = host.group("QA").unwrap();
    group.assign(1, None, None).await.unwrap();

    // Reset the drone directly, bypassing the group bookkeeping: the drone
    // obeys, the group only notices at its next exchange.
    let mut expect = std::collections::HashSet::from(["d1".to_owned()]);
    let answers = host.reset("d1", None, Some(&mut expect)).await.unwrap();
    assert!(expect.is_empty(), "the drone must acknowledge the reset");
    assert_eq!(answers["d1"].status().unwrap().code, 0);
    assert!(d1.group().is_none());
}

#[tokio::test]
async fn disband_is_best_effort_and_idempotent() {
    let port = 47236;
    let ok = DroneScript::default();
    let stuck = DroneScript {
        ignore_reset: true,
        ..DroneScript::default()
    };
    let d1 = MockDrone::spawn("d1", endpoint(port), ok).await.unwrap();
    let _d2 = MockDrone::spawn("d2", endpoint(port), stuck).await.unwrap();
    let host = Host::bind(host_config(port, Duration::from_secs(19))).unwrap();

    let g1 = host.group("QA").unwrap();
    g1.assign(2, None, None).await.unwrap();

    // One drone ignores the reset; disband must swallow that and finish.
    host.disband(None).await;
    assert!(g1.members().is_empty());
    assert!(d1.group().is_none());

    // Second teardown has nothing left to do and must not fail either.
    host.disband(None).await;
}
