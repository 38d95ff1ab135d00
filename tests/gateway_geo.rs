mod common;

use std::time::Duration;

use heimdall_gateway::RequestContext;
use heimdall_gateway::gateway::admission::Completion;
use heimdall_gateway::gateway::telemetry::{GeoLocator, HttpGeoLocator};
use httpmock::Method::GET;
use httpmock::MockServer;

use common::{NOW, gateway, seed_account};

#[tokio::test]
async fn http_locator_reads_ip_api_fields() {
    if !common::can_bind_localhost() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/json/8.8.8.8");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"countryCode":"US","regionName":"California","city":"Mountain View"}"#);
        })
        .await;

    let locator = HttpGeoLocator::new(
        format!("{}/json/{{ip}}", server.base_url()),
        Duration::from_millis(500),
    )
    .expect("client");
    let location = locator.locate("8.8.8.8").await.expect("located");
    assert_eq!(location.country_code.as_deref(), Some("US"));
    assert_eq!(location.region.as_deref(), Some("California"));
    mock.assert_async().await;

    // Private addresses never leave the process.
    assert!(locator.locate("10.0.0.8").await.is_none());
    mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn failed_lookup_leaves_location_empty() {
    if !common::can_bind_localhost() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(503);
        })
        .await;
    let locator = HttpGeoLocator::new(server.base_url(), Duration::from_millis(500)).expect("client");
    assert!(locator.locate("1.1.1.1").await.is_none());
}

#[tokio::test]
async fn telemetry_rows_are_enriched_by_workers() {
    if !common::can_bind_localhost() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/8.8.8.8");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"country_code":"US","region":"CA","city":"Mountain View"}"#);
        })
        .await;

    let url = server.base_url();
    let gw = gateway(|config| {
        config.telemetry.geolocation_enabled = true;
        config.telemetry.geolocation_url = Some(url);
        config.telemetry.geolocation_timeout_ms = 500;
    })
    .await;
    let account = seed_account(gw.heimdall.store(), "alice", "key-alice", 1_000).await;

    let mut ctx = RequestContext::new("POST", "/v1/chat/completions")
        .with_header("authorization", "Bearer sk-key-alice")
        .with_header("content-type", "application/json")
        .with_header("x-request-id", "req-geo")
        .with_header("x-forwarded-for", "8.8.8.8")
        .with_body(r#"{"model":"gpt-4o"}"#);
    let admission = gw.heimdall.admit(&mut ctx).await.expect("admit");
    gw.heimdall
        .complete(
            &ctx,
            &admission,
            &Completion {
                status: 200,
                upstream_provider: "stub".to_string(),
                ..Completion::default()
            },
        )
        .await
        .expect("complete");
    gw.heimdall.shutdown().await;

    let logs = gw
        .heimdall
        .store()
        .heimdall_logs_for_user(account.user_id, 0, NOW as i64 + 60, 10)
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].country_code.as_deref(), Some("US"));
    assert_eq!(logs[0].city.as_deref(), Some("Mountain View"));
}
