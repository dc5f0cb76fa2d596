//! Tests for the shared polling loop.

use std::time::Duration;

use rstest::rstest;
use tokio::time::Instant;

use super::{PollSettings, PollState, PollerKind, PollingAction, SHORT_TIMEOUT};
use crate::openstack::error::ApiFailure;
use crate::openstack::rest::Method;
use crate::openstack::OpenstackError;

fn transient() -> OpenstackError {
    OpenstackError::Api(Box::new(ApiFailure {
        method: Method::Get,
        path: String::from("/servers/x"),
        status: 503,
        history: Vec::new(),
    }))
}

fn settings(timeout_secs: u64) -> PollSettings {
    PollSettings::new(Duration::from_secs(timeout_secs)).with_interval(Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn returns_the_first_completed_value() {
    let mut driver = PollingAction::new(PollerKind::DeleteServer, settings(30));
    let mut calls = 0_u32;

    let value = driver
        .run(async |_: Duration| {
            calls += 1;
            Ok::<_, OpenstackError>((calls == 3).then_some("done"))
        })
        .await
        .unwrap_or_else(|err| panic!("poll should finish: {err}"));

    assert_eq!(value, "done");
    assert_eq!(driver.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn times_out_exactly_at_the_deadline() {
    let mut driver = PollingAction::new(PollerKind::DeleteVolume, settings(10));
    assert_eq!(driver.state(), PollState::Pending);
    let started = Instant::now();

    let err = driver
        .run(async |_: Duration| Ok::<Option<()>, OpenstackError>(None))
        .await
        .expect_err("never completes");

    assert!(matches!(
        err,
        OpenstackError::Timeout {
            action: PollerKind::DeleteVolume,
            ..
        }
    ));
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(driver.attempts(), 10);
    assert_eq!(driver.state(), PollState::Polling);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let mut driver = PollingAction::new(PollerKind::CreateServer, settings(30));
    let mut calls = 0_u32;

    let value = driver
        .run(async |_: Duration| {
            calls += 1;
            if calls < 3 {
                Err(transient())
            } else {
                Ok(Some(calls))
            }
        })
        .await
        .unwrap_or_else(|err| panic!("transient failures should be absorbed: {err}"));

    assert_eq!(value, 3);
}

#[tokio::test(start_paused = true)]
async fn fatal_errors_end_the_loop_immediately() {
    let mut driver = PollingAction::new(PollerKind::CreateServer, settings(30));

    let err = driver
        .run(async |_: Duration| {
            Err::<Option<()>, _>(OpenstackError::Ambiguous {
                name: String::from("web2"),
                count: 2,
            })
        })
        .await
        .expect_err("ambiguity is fatal");

    assert!(matches!(err, OpenstackError::Ambiguous { count: 2, .. }));
    assert_eq!(driver.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn check_sees_the_shrinking_remaining_time() {
    let mut driver = PollingAction::new(PollerKind::DeleteServer, settings(5));
    let mut seen = Vec::new();

    driver
        .run(async |remaining: Duration| {
            seen.push(remaining);
            Ok::<_, OpenstackError>((seen.len() == 2).then_some(()))
        })
        .await
        .unwrap_or_else(|err| panic!("poll should finish: {err}"));

    assert_eq!(seen, vec![Duration::from_secs(4), Duration::from_secs(3)]);
}

#[rstest]
#[case(PollerKind::AttachVolume, 300, SHORT_TIMEOUT)]
#[case(PollerKind::AssignFloatingIp, 60, Duration::from_secs(60))]
#[case(PollerKind::CreateServer, 300, Duration::from_secs(300))]
fn per_kind_deadline_caps(
    #[case] kind: PollerKind,
    #[case] configured: u64,
    #[case] expected: Duration,
) {
    let driver = PollingAction::new(kind, PollSettings::new(Duration::from_secs(configured)));
    assert_eq!(driver.timeout(), expected);
    assert_eq!(driver.remaining(), expected);
}
