use anyhow::Result;
use mail_service::clients::api::ApiClient;
use mail_service::clients::token::TokenManager;
use mail_service::models::job::EmailJob;
use mail_service::resolver::RecipientResolver;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    server: MockServer,
    resolver: RecipientResolver,
    _shutdown_tx: watch::Sender<bool>,
}

async fn fixture() -> Result<Fixture> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Authentication", "tok-1")
                .set_body_json(json!({ "expires_in": 3600 })),
        )
        .mount(&server)
        .await;

    let (shutdown_tx, shutdown) = watch::channel(false);
    let tokens = TokenManager::spawn(&server.uri(), "client", "secret", 1800, shutdown)?;
    let resolver = RecipientResolver::new(ApiClient::new(&server.uri(), tokens, 3)?);

    Ok(Fixture {
        server,
        resolver,
        _shutdown_tx: shutdown_tx,
    })
}

fn job(payload: serde_json::Value) -> EmailJob {
    EmailJob::parse(payload.to_string().as_bytes()).unwrap()
}

/// Test: explicit addresses come first, API lookups follow, in order
#[tokio::test]
async fn explicit_addresses_precede_lookups() -> Result<()> {
    let fx = fixture().await?;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "email": "b@example.com" } })),
        )
        .mount(&fx.server)
        .await;

    let resolved = fx
        .resolver
        .resolve(&job(json!({
            "to": "a@example.com",
            "ids": [1],
            "endpoint": "users",
            "subject": "Hi",
        })))
        .await;

    assert_eq!(resolved, vec!["a@example.com", "b@example.com"]);
    Ok(())
}

/// Test: addresses appearing in both sources are kept once
#[tokio::test]
async fn duplicates_collapse_to_first_occurrence() -> Result<()> {
    let fx = fixture().await?;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "contacts": [
                    { "email": "a@example.com" },
                    { "email": "c@example.com" },
                ],
            },
        })))
        .mount(&fx.server)
        .await;

    let resolved = fx
        .resolver
        .resolve(&job(json!({
            "to": ["a@example.com"],
            "ids": [1],
            "endpoint": "users",
            "subject": "Hi",
        })))
        .await;

    assert_eq!(resolved, vec!["a@example.com", "c@example.com"]);
    Ok(())
}

/// Test: a failing lookup shrinks the result instead of aborting the job
#[tokio::test]
async fn failed_lookup_is_skipped() -> Result<()> {
    let fx = fixture().await?;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "email": "b@example.com" } })),
        )
        .mount(&fx.server)
        .await;

    let resolved = fx
        .resolver
        .resolve(&job(json!({
            "ids": [1, 2],
            "endpoint": "users",
            "subject": "Hi",
        })))
        .await;

    assert_eq!(resolved, vec!["b@example.com"]);
    Ok(())
}

/// Test: a non-null error field in the body counts as a failed lookup
#[tokio::test]
async fn error_field_marks_the_lookup_failed() -> Result<()> {
    let fx = fixture().await?;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "user not found",
            "data": { "email": "ghost@example.com" },
        })))
        .mount(&fx.server)
        .await;

    let resolved = fx
        .resolver
        .resolve(&job(json!({
            "ids": [1],
            "endpoint": "users",
            "subject": "Hi",
        })))
        .await;

    assert!(resolved.is_empty());
    Ok(())
}

/// Test: every lookup failing yields an empty recipient set
#[tokio::test]
async fn all_lookups_failing_yields_empty() -> Result<()> {
    let fx = fixture().await?;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fx.server)
        .await;

    let resolved = fx
        .resolver
        .resolve(&job(json!({
            "ids": [1, 2, 3],
            "endpoint": "users",
            "subject": "Hi",
        })))
        .await;

    assert!(resolved.is_empty());
    Ok(())
}

/// Test: string ids build the same lookup path as numeric ids
#[tokio::test]
async fn string_ids_are_supported() -> Result<()> {
    let fx = fixture().await?;
    Mock::given(method("GET"))
        .and(path("/teams/alpha"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "email": "lead@example.com" } })),
        )
        .expect(1)
        .mount(&fx.server)
        .await;

    let resolved = fx
        .resolver
        .resolve(&job(json!({
            "ids": ["alpha"],
            "endpoint": "teams",
            "subject": "Hi",
        })))
        .await;

    assert_eq!(resolved, vec!["lead@example.com"]);
    Ok(())
}
