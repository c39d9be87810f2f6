//! End-to-End Integration Harness: group requests and reply classification.
//!
//! Covers the fan-out `call` path against scripted drone behaviors:
//! accept-then-status progress replies, silent members, drone-side error
//! codes, unsupported commands, and replies from outside the membership.
//!
//! Ports are per-test so parallel test threads never cross-talk.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use ud_test_utils::{Behavior, DroneScript, MockDrone};
use udrone::protocol::{errno, msgtype};
use udrone::{DroneError, Group, Host, HostConfig};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn endpoint(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(239, 6, 6, 6), port)
}

fn host_config(port: u16) -> HostConfig {
    HostConfig {
        multicast_addr: SocketAddr::V4(endpoint(port)),
        source_addr: Some(Ipv4Addr::LOCALHOST),
        ..HostConfig::default()
    }
}

/// Spawn drones, bind a host, and engage every drone into a fresh group.
async fn engage_fleet(
    port: u16,
    scripts: Vec<(&str, DroneScript)>,
) -> (Host, Group, Vec<MockDrone>) {
    let mut drones = Vec::new();
    for (id, script) in scripts {
        drones.push(MockDrone::spawn(id, endpoint(port), script).await.unwrap());
    }
    let host = Host::bind(host_config(port)).unwrap();
    let group = host.group("QA").unwrap();
    let engaged = group.assign(drones.len(), None, None).await.unwrap();
    assert_eq!(engaged.len(), drones.len());
    (host, group, drones)
}

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_collects_immediate_and_accept_then_status_replies() {
    let slow = DroneScript::default()
        .with_behavior("run", Behavior::AcceptThenOk(Duration::from_millis(1200)));
    let fast = DroneScript::default().with_behavior("run", Behavior::Ok);
    let (_host, group, _drones) =
        engage_fleet(47221, vec![("d1", slow), ("d2", fast)]).await;

    let started = Instant::now();
    let answers = group
        .call(
            "run",
            Some(&serde_json::json!({"x": 1})),
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "both terminal replies should land well before the timeout"
    );

    assert_eq!(answers.len(), 2);
    for drone in ["d1", "d2"] {
        let env = answers[drone].as_ref().expect("terminal reply recorded");
        assert_eq!(env.msgtype, msgtype::STATUS);
        assert_eq!(env.status().unwrap().code, 0);
    }
}

#[tokio::test]
async fn call_merges_into_the_update_map_when_given() {
    let script = DroneScript::default().with_behavior("run", Behavior::Ok);
    let (_host, group, _drones) = engage_fleet(47222, vec![("d1", script)]).await;

    let mut rolling = udrone::ReplyMap::new();
    rolling.insert("stale".to_owned(), None);
    group
        .call("run", None, Duration::from_secs(5), Some(&mut rolling))
        .await
        .unwrap();
    assert!(rolling.contains_key("d1"), "fresh replies must merge in");
    assert!(rolling.contains_key("stale"), "existing entries must survive");
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_raises_not_reachable_for_a_silent_member() {
    let script = DroneScript::default().with_behavior("run", Behavior::Silent);
    let (_host, group, _drones) = engage_fleet(47223, vec![("d1", script)]).await;

    let err = group
        .call("run", None, Duration::from_secs(3), None)
        .await
        .unwrap_err();
    match err {
        DroneError::NotReachable(ids) => assert_eq!(ids, vec!["d1".to_owned()]),
        other => panic!("expected NotReachable, got {other:?}"),
    }
}

#[tokio::test]
async fn call_surfaces_drone_error_codes_and_messages() {
    let script = DroneScript::default().with_behavior(
        "run",
        Behavior::Fail {
            code: 7,
            errstr: "bad arg".to_owned(),
        },
    );
    let (_host, group, _drones) = engage_fleet(47224, vec![("d1", script)]).await;

    let err = group
        .call("run", None, Duration::from_secs(5), None)
        .await
        .unwrap_err();
    match err {
        DroneError::Runtime {
            code,
            errstr,
            drone,
        } => {
            assert_eq!(code, 7);
            assert_eq!(errstr.as_deref(), Some("bad arg"));
            assert_eq!(drone, "d1");
        }
        other => panic!("expected Runtime, got {other:?}"),
    }
}

#[tokio::test]
async fn call_maps_unsupported_commands_to_eopnotsupp() {
    // No scripted behavior for the command: the drone answers `unsupported`.
    let (_host, group, _drones) =
        engage_fleet(47225, vec![("d1", DroneScript::default())]).await;

    let err = group
        .call("frobnicate", None, Duration::from_secs(5), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, DroneError::Runtime { code, .. } if code == errno::EOPNOTSUPP),
        "unsupported replies must map to EOPNOTSUPP"
    );
}

#[tokio::test]
async fn call_flags_replies_from_outside_the_membership() {
    // The member answers late so the stray reply is always drained while the
    // member is still awaited.
    let member = DroneScript::default()
        .with_behavior("run", Behavior::DelayedOk(Duration::from_millis(300)));
    let (_host, group, _drones) = engage_fleet(47226, vec![("d1", member)]).await;

    // A misbehaving drone that answers the group address without ever having
    // been engaged. Spawned after assignment so discovery cannot pick it up.
    let shadow = DroneScript {
        shadow_group: Some(group.id().to_owned()),
        ..DroneScript::default()
    }
    .with_behavior("run", Behavior::Ok);
    let _dz = MockDrone::spawn("dZ", endpoint(47226), shadow).await.unwrap();

    let err = group
        .call("run", None, Duration::from_secs(5), None)
        .await
        .unwrap_err();
    match err {
        DroneError::Conflict(ids) => assert_eq!(ids, vec!["dZ".to_owned()]),
        other => panic!("expected Conflict, got {other:?}"),
    }
}
