//! One user's full journey through the HTTP surface.

use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::Filter;

use tenant_plane::api::{handle_rejection, routes, USER_HEADER};

use super::common::*;

async fn send(env: &TestEnv, method: &str, path: &str, body: Value) -> (StatusCode, Value) {
    let api = routes(env.ctx.clone()).recover(handle_rejection);
    let res = warp::test::request()
        .method(method)
        .path(path)
        .header(USER_HEADER, USER)
        .json(&body)
        .reply(&api)
        .await;
    let value = serde_json::from_slice(res.body()).unwrap_or(Value::Null);
    (res.status(), value)
}

#[tokio::test]
async fn create_enable_and_purge_a_site() {
    let env = TestEnv::new();

    let (status, site) = send(&env, "POST", "/sites", json!({ "domain": DOMAIN })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(site["slug"], SLUG);
    assert_eq!(site["tenantId"], USER);

    let (_, view) = send(&env, "GET", &format!("/sites/{SLUG}"), Value::Null).await;
    assert_eq!(view["ready"], false);
    assert_eq!(view["domain"], DOMAIN);

    let (status, db) = send(&env, "POST", &format!("/sites/{SLUG}/db/enable"), Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(db["dbName"], "t_u1_app_example_com");
    assert!(env.db.lock().databases.contains_key("t_u1_app_example_com"));

    let (status, _) = send(
        &env,
        "POST",
        &format!("/sites/{SLUG}/backup/enable"),
        json!({ "retentionDays": 14 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, snaps) = send(&env, "GET", &format!("/sites/{SLUG}/backup/snapshots"), Value::Null).await;
    assert_eq!(snaps, json!([]));

    let (status, report) = send(
        &env,
        "POST",
        &format!("/sites/{SLUG}/purge"),
        json!({ "confirm": "DELETE" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["existed"], true);
    assert_eq!(report["databaseDropped"], true);

    let (status, list) = send(&env, "GET", "/sites", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list, json!([]));
    assert!(env.db.lock().databases.is_empty());
}
