//! Tests for the request cache.

use serde_json::json;

use super::*;
use crate::test_support::{FakeCloud, ReplaySession};

#[tokio::test]
async fn unwrap_extracts_the_named_key() {
    let cloud = FakeCloud::new().with_flavor("f1");
    let mut rest = cloud.request_cache();

    let flavors = rest
        .request(Service::Compute, "/flavors", Some("flavors"), Method::Get, None)
        .await
        .unwrap_or_else(|err| panic!("listing should succeed: {err}"));

    assert_eq!(flavors, json!([{"id": "flavor-f1", "name": "f1"}]));
    assert_eq!(rest.cached(), Some(&flavors));
}

#[tokio::test]
async fn missing_unwrap_key_is_a_shape_error() {
    let cloud = FakeCloud::new();
    let mut rest = cloud.request_cache();

    let err = rest
        .request(Service::Compute, "/flavors", Some("images"), Method::Get, None)
        .await
        .expect_err("key is absent");

    assert!(matches!(err, OpenstackError::Shape { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn rejected_status_carries_the_history() {
    let cloud = FakeCloud::new();
    let mut rest = cloud.request_cache();
    rest.server_list("id")
        .await
        .unwrap_or_else(|err| panic!("listing should succeed: {err}"));

    let err = rest
        .request(Service::Compute, "/servers/missing", Some("server"), Method::Get, None)
        .await
        .expect_err("server is missing");

    assert_eq!(err.api_status(), Some(404));
    let OpenstackError::Api(failure) = err else {
        panic!("expected an API failure");
    };
    assert_eq!(failure.history.len(), 2);
    assert_eq!(rest.last().map(|exchange| exchange.status), Some(404));
}

#[tokio::test]
async fn empty_body_decodes_to_null() {
    let cloud = FakeCloud::new();
    let server = cloud.add_server("web1", None);
    let mut rest = cloud.request_cache();

    let deleted = rest
        .request(Service::Compute, &format!("/servers/{server}"), None, Method::Delete, None)
        .await
        .unwrap_or_else(|err| panic!("delete should be accepted: {err}"));

    assert_eq!(deleted, Value::Null);
    assert_eq!(rest.last().and_then(|exchange| exchange.body.clone()), None);
}

#[test]
fn child_search_needs_a_cached_list() {
    let cloud = FakeCloud::new();
    let rest = cloud.request_cache();

    let err = rest
        .child_search("name", "web1", None)
        .expect_err("nothing is cached");

    assert!(matches!(err, OpenstackError::Precondition(_)));
}

#[tokio::test]
async fn child_helpers_walk_the_cached_list() {
    let cloud = FakeCloud::new();
    let first = cloud.add_server("web1", None);
    cloud.add_server("web2", None);
    let mut rest = cloud.request_cache();
    rest.request(Service::Compute, "/servers", Some("servers"), Method::Get, None)
        .await
        .unwrap_or_else(|err| panic!("listing should succeed: {err}"));

    let names = rest
        .child_strings("name", None)
        .unwrap_or_else(|err| panic!("names should resolve: {err}"));
    let found = rest
        .child_search("name", "web1", None)
        .unwrap_or_else(|err| panic!("web1 should be listed: {err}"));
    let missing = rest
        .child_search("name", "web3", None)
        .expect_err("web3 is not listed");

    assert_eq!(names, vec![String::from("web1"), String::from("web2")]);
    assert_eq!(found.get("id").and_then(Value::as_str), Some(first.as_str()));
    assert!(missing.is_not_found());
}

#[test]
fn explicit_list_overrides_the_cache() {
    let rest = RequestCache::new(SessionMap::new());
    let list = [json!({"id": "a"}), json!({"name": "b"}), json!({"id": 3})];

    let values = rest
        .child_values("id", Some(&list))
        .unwrap_or_else(|err| panic!("values should resolve: {err}"));
    let strings = rest
        .child_strings("id", Some(&list))
        .unwrap_or_else(|err| panic!("strings should resolve: {err}"));

    assert_eq!(values, vec![json!("a"), json!(3)]);
    assert_eq!(strings, vec![String::from("a")]);
}

#[tokio::test]
async fn missing_session_is_a_precondition_failure() {
    let mut rest = RequestCache::new(SessionMap::new());

    let err = rest
        .request(Service::Volume, "/volumes", None, Method::Get, None)
        .await
        .expect_err("no session is configured");

    assert!(matches!(err, OpenstackError::Precondition(_)));
    assert_eq!(rest.exchange_count(), 0);
}

#[tokio::test]
async fn dump_replays_through_a_new_cache() {
    let cloud = FakeCloud::new().with_flavor("f1");
    let mut recorded = cloud.request_cache();
    let flavor = recorded
        .flavor_id("f1")
        .await
        .unwrap_or_else(|err| panic!("flavor should resolve: {err}"));

    let replay = ReplaySession::from_dump(&recorded.dump())
        .unwrap_or_else(|err| panic!("dump should parse: {err}"));
    let mut rest = RequestCache::new(replay.sessions());
    let replayed = rest
        .flavor_id("f1")
        .await
        .unwrap_or_else(|err| panic!("replay should answer: {err}"));

    assert_eq!(replayed, flavor);
    assert_eq!(replay.remaining(), 0);
    let err = rest.flavor_id("f1").await.expect_err("dump is exhausted");
    assert!(matches!(err, OpenstackError::Transport { .. }));
}
