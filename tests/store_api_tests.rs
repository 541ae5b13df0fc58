//! End-to-end API behaviour against an in-process fake store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, RawQuery};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tempfile::TempDir;

use common::{serve, test_config, test_store, FakeAuthContext, FakeCodec};
use snapstore::auth::UserCredentials;
use snapstore::store::actions::{
    ActionKind, CurrentSnap, RefreshOptions, SnapAction,
};
use snapstore::store::catalog::SnapAdder;
use snapstore::store::commerce::BuyOptions;
use snapstore::store::discovery::Search;
use snapstore::types::Revision;
use snapstore::{Store, StoreError};

fn info_body(name: &str, snap_id: &str, revision: i32) -> serde_json::Value {
    json!({
        "channel-map": [{
            "channel": {"architecture": "amd64", "name": "latest/stable",
                        "risk": "stable", "track": "latest"},
            "revision": revision,
            "version": "1.0",
            "confinement": "strict",
            "download": {"url": "https://cdn.example/blob", "size": 100,
                         "sha3-384": "aabb"}
        }],
        "snap": {"name": name, "snap-id": snap_id, "summary": "a snap"},
        "name": name,
        "snap-id": snap_id
    })
}

#[tokio::test]
async fn snap_info_decodes_and_extracts_currency() {
    let seen_headers: Arc<Mutex<Option<HeaderMap>>> = Arc::default();
    let seen = seen_headers.clone();
    let app = Router::new().route(
        "/v2/snaps/info/{name}",
        get(move |Path(name): Path<String>, headers: HeaderMap| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(headers);
                (
                    StatusCode::OK,
                    [("X-Suggested-Currency", "GBP")],
                    Json(info_body(&name, "hello-id", 12)),
                )
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let info = store.snap_info("hello", None).await.unwrap();
    assert_eq!(info.name, "hello");
    assert_eq!(info.snap_id, "hello-id");
    assert_eq!(info.revision, Revision(12));
    assert_eq!(info.channel, "latest/stable");
    assert_eq!(store.suggested_currency(), "GBP");

    let headers = seen_headers.lock().unwrap().take().unwrap();
    assert!(headers.get("User-Agent").is_some());
    assert_eq!(headers.get("Snap-Device-Series").unwrap(), "16");
    assert_eq!(headers.get("Snap-Classic").unwrap(), "false");
    assert_eq!(
        headers.get("Snap-Device-Capabilities").unwrap(),
        "default-tracks"
    );
    // v2 requests do not carry the v1 wire protocol header
    assert!(headers.get("X-Ubuntu-Wire-Protocol").is_none());
}

#[tokio::test]
async fn snap_info_not_found() {
    let app = Router::new().route(
        "/v2/snaps/info/{name}",
        get(|| async { (StatusCode::NOT_FOUND, Json(json!({}))) }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let err = store.snap_info("missing", None).await.unwrap_err();
    assert!(matches!(err, StoreError::SnapNotFound));
}

#[tokio::test]
async fn find_rejects_bad_query_without_network() {
    let work = TempDir::new().unwrap();
    let store = test_store("http://127.0.0.1:1/", &work);

    for query in ["nvidia*", "foo[bar]", "hello?", "a+b", "x:y"] {
        let err = store
            .find(
                &Search {
                    query: query.to_string(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadQuery), "query {query:?}");
    }
    // "-" is a legal part of snap names and passes validation; the query
    // reaches the (empty) server and fails there instead
    let base = serve(Router::new()).await;
    let store = test_store(&base, &work);
    let err = store
        .find(
            &Search {
                query: "ab-".to_string(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(!matches!(err, StoreError::BadQuery));
}

#[tokio::test]
async fn find_rejects_invalid_scope_without_network() {
    let work = TempDir::new().unwrap();
    let store = test_store("http://127.0.0.1:1/", &work);

    let err = store
        .find(
            &Search {
                query: "hello".to_string(),
                scope: "creative".to_string(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidScope));
}

#[tokio::test]
async fn find_private_needs_user() {
    let work = TempDir::new().unwrap();
    let store = test_store("http://127.0.0.1:1/", &work);

    let err = store
        .find(
            &Search {
                query: "hello".to_string(),
                private: true,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unauthenticated));
}

#[tokio::test]
async fn find_restricts_channel_without_scope() {
    let seen_query: Arc<Mutex<String>> = Arc::default();
    let seen = seen_query.clone();
    let app = Router::new().route(
        "/v2/snaps/find",
        get(move |RawQuery(query): RawQuery| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = query.unwrap_or_default();
                Json(json!({"results": []}))
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let snaps = store
        .find(
            &Search {
                query: "hello".to_string(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert!(snaps.is_empty());
    let query = seen_query.lock().unwrap().clone();
    assert!(query.contains("channel=stable"), "query: {query}");
    assert!(query.contains("q=hello"), "query: {query}");
    assert!(query.contains("confinement=strict"), "query: {query}");
}

#[tokio::test]
async fn find_falls_back_to_v1_on_old_store() {
    let v1_query: Arc<Mutex<String>> = Arc::default();
    let seen = v1_query.clone();
    let app = Router::new()
        .route(
            "/v2/snaps/find",
            get(|| async { (StatusCode::NOT_FOUND, [("Snap-Store-Version", "19")], "") }),
        )
        .route(
            "/api/v1/snaps/search",
            get(move |RawQuery(query): RawQuery| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = query.unwrap_or_default();
                    (
                        StatusCode::OK,
                        [("Content-Type", "application/hal+json")],
                        json!({
                            "_embedded": {
                                "clickindex:package": [{
                                    "package_name": "legacy",
                                    "snap_id": "legacy-id",
                                    "revision": 9,
                                    "version": "0.9",
                                    "channel": "stable",
                                    "anon_download_url": "https://cdn.example/anon",
                                    "download_url": "https://cdn.example/auth",
                                    "download_sha3_384": "cc",
                                    "binary_filesize": 5
                                }]
                            }
                        })
                        .to_string(),
                    )
                }
            }),
        );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let snaps = store
        .find(
            &Search {
                common_id: "org.example.legacy".to_string(),
                category: "games".to_string(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "legacy");
    assert_eq!(snaps[0].revision, Revision(9));

    // v1 uses the old parameter spellings
    let query = v1_query.lock().unwrap().clone();
    assert!(query.contains("common_id=org.example.legacy"), "query: {query}");
    assert!(query.contains("section=games"), "query: {query}");
}

#[tokio::test]
async fn find_with_new_store_version_does_not_fall_back() {
    let app = Router::new().route(
        "/v2/snaps/find",
        get(|| async { (StatusCode::NOT_FOUND, [("Snap-Store-Version", "30")], "") }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let err = store
        .find(
            &Search {
                query: "hello".to_string(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnexpectedStatus { status: 404, .. }));
}

#[tokio::test]
async fn sections_lists_names() {
    let seen_headers: Arc<Mutex<Option<HeaderMap>>> = Arc::default();
    let seen = seen_headers.clone();
    let app = Router::new().route(
        "/api/v1/snaps/sections",
        get(move |headers: HeaderMap| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(headers);
                (
                    StatusCode::OK,
                    [("Content-Type", "application/hal+json")],
                    json!({
                        "_embedded": {
                            "clickindex:sections": [
                                {"name": "featured"}, {"name": "games"}
                            ]
                        }
                    })
                    .to_string(),
                )
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let sections = store.sections(None).await.unwrap();
    assert_eq!(sections, vec!["featured".to_string(), "games".to_string()]);

    // a v1 endpoint: old header spellings and the wire protocol marker
    let headers = seen_headers.lock().unwrap().take().unwrap();
    assert_eq!(headers.get("X-Ubuntu-Series").unwrap(), "16");
    assert_eq!(headers.get("X-Ubuntu-Wire-Protocol").unwrap(), "1");
}

#[tokio::test]
async fn refresh_at_same_revision_reports_no_update() {
    let seen_body: Arc<Mutex<Option<serde_json::Value>>> = Arc::default();
    let seen = seen_body.clone();
    let app = Router::new().route(
        "/v2/snaps/refresh",
        post(move |body: Bytes| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(serde_json::from_slice(&body).unwrap());
                Json(json!({
                    "results": [{
                        "result": "refresh",
                        "instance-key": "hello-id",
                        "snap-id": "hello-id",
                        "name": "hello",
                        "snap": {"name": "hello", "snap-id": "hello-id", "revision": 5}
                    }]
                }))
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let current = [CurrentSnap {
        instance_name: "hello".to_string(),
        snap_id: "hello-id".to_string(),
        revision: Revision(5),
        ..Default::default()
    }];
    let actions = [SnapAction::new(ActionKind::Refresh, "hello")];
    let err = store
        .snap_action(&current, &actions, None, &RefreshOptions::default())
        .await
        .unwrap_err();

    let StoreError::SnapAction(sa_err) = err else {
        panic!("expected a snap action error");
    };
    assert!(sa_err.results.is_empty());
    assert!(!sa_err.no_results);
    assert!(matches!(
        sa_err.refresh.get("hello"),
        Some(StoreError::NoUpdateAvailable)
    ));

    // wire format: context keyed by raw snap-id, refresh omits the epoch
    let body = seen_body.lock().unwrap().take().unwrap();
    assert_eq!(body["context"][0]["instance-key"], "hello-id");
    assert_eq!(body["context"][0]["tracking-channel"], "stable");
    assert_eq!(body["actions"][0]["action"], "refresh");
    assert!(body["actions"][0].get("epoch").is_none());
}

#[tokio::test]
async fn install_returns_result_and_sends_null_epoch() {
    let seen_body: Arc<Mutex<Option<serde_json::Value>>> = Arc::default();
    let seen = seen_body.clone();
    let app = Router::new().route(
        "/v2/snaps/refresh",
        post(move |body: Bytes| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(serde_json::from_slice(&body).unwrap());
                Json(json!({
                    "results": [{
                        "result": "install",
                        "instance-key": "install-1",
                        "snap-id": "new-id",
                        "name": "newsnap",
                        "effective-channel": "stable",
                        "redirect-channel": "latest/stable",
                        "snap": {"name": "newsnap", "snap-id": "new-id", "revision": 3}
                    }]
                }))
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let mut action = SnapAction::new(ActionKind::Install, "newsnap");
    action.channel = "stable".to_string();
    let results = store
        .snap_action(&[], &[action], None, &RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].info.name, "newsnap");
    assert_eq!(results[0].info.revision, Revision(3));
    assert_eq!(results[0].redirect_channel, "latest/stable");

    let body = seen_body.lock().unwrap().take().unwrap();
    assert_eq!(body["actions"][0]["instance-key"], "install-1");
    // install always sends an epoch so the server knows we handle them;
    // null means "default epoch"
    assert!(body["actions"][0].get("epoch").is_some());
    assert!(body["actions"][0]["epoch"].is_null());
}

#[tokio::test]
async fn snap_action_retries_on_soft_expired_auth() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_seen = calls.clone();
    let app = Router::new().route(
        "/v2/snaps/refresh",
        post(move || {
            let calls = calls_seen.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Json(json!({
                        "results": [],
                        "error-list": [{
                            "code": "user-authorization-needs-refresh",
                            "message": "soft expiry"
                        }]
                    }))
                } else {
                    Json(json!({
                        "results": [{
                            "result": "install",
                            "instance-key": "install-1",
                            "snap-id": "new-id",
                            "name": "newsnap",
                            "snap": {"name": "newsnap", "snap-id": "new-id", "revision": 3}
                        }]
                    }))
                }
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let ctx = Arc::new(FakeAuthContext::with_session());
    let store = Store::new(test_config(&base, &work), Some(ctx.clone()))
        .unwrap()
        .with_macaroon_codec(Arc::new(FakeCodec));
    let user = UserCredentials::new("store|root", vec!["other|d1".to_string()]);

    let results = store
        .snap_action(
            &[],
            &[SnapAction::new(ActionKind::Install, "newsnap")],
            Some(&user),
            &RefreshOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.user_refreshes.load(Ordering::SeqCst), 1);
    // the refreshed discharges were persisted back into the shared handle
    assert_eq!(user.discharges(), vec!["other|d1-persisted".to_string()]);
}

#[tokio::test]
async fn unauthorized_response_triggers_refresh_dance() {
    let calls = Arc::new(AtomicUsize::new(0));
    let nonce_calls = Arc::new(AtomicUsize::new(0));
    let session_calls = Arc::new(AtomicUsize::new(0));
    let second_device_auth: Arc<Mutex<Option<String>>> = Arc::default();

    let calls_seen = calls.clone();
    let device_auth_seen = second_device_auth.clone();
    let nonce_seen = nonce_calls.clone();
    let session_seen = session_calls.clone();
    let app = Router::new()
        .route(
            "/v2/snaps/info/{name}",
            get(move |Path(name): Path<String>, headers: HeaderMap| {
                let calls = calls_seen.clone();
                let device_auth = device_auth_seen.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            StatusCode::UNAUTHORIZED,
                            [(
                                "WWW-Authenticate",
                                "Macaroon needs_refresh=1, refresh_device_session=1",
                            )],
                            Json(json!({})),
                        )
                    } else {
                        *device_auth.lock().unwrap() = headers
                            .get("Snap-Device-Authorization")
                            .map(|v| v.to_str().unwrap().to_string());
                        (
                            StatusCode::OK,
                            [("WWW-Authenticate", "")],
                            Json(info_body(&name, "hello-id", 12)),
                        )
                    }
                }
            }),
        )
        .route(
            "/api/v1/snaps/auth/nonces",
            post(move || {
                let nonce = nonce_seen.clone();
                async move {
                    nonce.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"nonce": "nonce-1"}))
                }
            }),
        )
        .route(
            "/api/v1/snaps/auth/sessions",
            post(move |body: Bytes| {
                let session = session_seen.clone();
                async move {
                    session.fetch_add(1, Ordering::SeqCst);
                    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
                    assert_eq!(body["device-session-request"], "signed-nonce-1");
                    Json(json!({"macaroon": "session-2"}))
                }
            }),
        );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let ctx = Arc::new(FakeAuthContext::with_session());
    let store = Store::new(test_config(&base, &work), Some(ctx.clone()))
        .unwrap()
        .with_macaroon_codec(Arc::new(FakeCodec));
    let user = UserCredentials::new("store|root", vec!["other|d1".to_string()]);

    let info = store.snap_info("hello", Some(&user)).await.unwrap();
    assert_eq!(info.name, "hello");

    // exactly one refresh each, then the retry went through
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.user_refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.device_refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(nonce_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session_calls.load(Ordering::SeqCst), 1);
    assert_eq!(user.discharges(), vec!["other|d1-persisted".to_string()]);
    // the retried request carried the fresh session macaroon
    assert_eq!(
        second_device_auth.lock().unwrap().as_deref(),
        Some(r#"Macaroon root="session-2""#)
    );
}

#[tokio::test]
async fn buy_cancelled_is_an_error() {
    let app = Router::new().route(
        "/api/v1/snaps/purchases/buy",
        post(|| async { Json(json!({"state": "Cancelled"})) }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);
    let user = UserCredentials::new("store|root", vec![]);

    let err = store
        .buy(
            &BuyOptions {
                snap_id: "hello-id".to_string(),
                price: 2.99,
                currency: "USD".to_string(),
            },
            Some(&user),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Buy(msg) if msg == "payment cancelled"));
}

#[tokio::test]
async fn buy_validates_input_without_network() {
    let work = TempDir::new().unwrap();
    let store = test_store("http://127.0.0.1:1/", &work);
    let user = UserCredentials::new("store|root", vec![]);

    let err = store
        .buy(&BuyOptions::default(), Some(&user))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Buy(msg) if msg.contains("snap ID missing")));

    let err = store
        .buy(
            &BuyOptions {
                snap_id: "id".to_string(),
                price: 0.0,
                currency: "USD".to_string(),
            },
            Some(&user),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Buy(msg) if msg.contains("invalid expected price")));

    let err = store
        .buy(
            &BuyOptions {
                snap_id: "id".to_string(),
                price: 1.0,
                currency: String::new(),
            },
            Some(&user),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Buy(msg) if msg.contains("currency missing")));

    let err = store
        .buy(
            &BuyOptions {
                snap_id: "id".to_string(),
                price: 1.0,
                currency: "USD".to_string(),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unauthenticated));
}

#[tokio::test]
async fn ready_to_buy_checks_account_state() {
    let app = Router::new().route(
        "/api/v1/snaps/purchases/customers/me",
        get(|| async {
            Json(json!({"latest_tos_accepted": true, "has_payment_method": false}))
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);
    let user = UserCredentials::new("store|root", vec![]);

    let err = store.ready_to_buy(Some(&user)).await.unwrap_err();
    assert!(matches!(err, StoreError::NoPaymentMethods));

    let app = Router::new().route(
        "/api/v1/snaps/purchases/customers/me",
        get(|| async {
            Json(json!({"latest_tos_accepted": false, "has_payment_method": true}))
        }),
    );
    let base = serve(app).await;
    let store = test_store(&base, &work);
    let err = store.ready_to_buy(Some(&user)).await.unwrap_err();
    assert!(matches!(err, StoreError::TermsNotAccepted));

    let app = Router::new().route(
        "/api/v1/snaps/purchases/customers/me",
        get(|| async {
            Json(json!({"latest_tos_accepted": true, "has_payment_method": true}))
        }),
    );
    let base = serve(app).await;
    let store = test_store(&base, &work);
    store.ready_to_buy(Some(&user)).await.unwrap();
}

#[tokio::test]
async fn create_cohorts_returns_key_map() {
    let app = Router::new().route(
        "/v2/cohorts",
        post(|body: Bytes| async move {
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["snaps"][0], "potato");
            Json(json!({"cohort-keys": {"potato": "cohort-xyz"}}))
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let keys = store
        .create_cohorts(&["potato".to_string()])
        .await
        .unwrap();
    assert_eq!(keys.get("potato").unwrap(), "cohort-xyz");
}

// the catalog decoder bridges async IO onto a blocking thread, which needs
// worker threads to drive it
#[tokio::test(flavor = "multi_thread")]
async fn write_catalogs_streams_packages() {
    #[derive(Default)]
    struct Recorder {
        snaps: Vec<String>,
    }
    impl SnapAdder for Recorder {
        fn add_snap(
            &mut self,
            snap_name: &str,
            _version: &str,
            _summary: &str,
            commands: &[String],
        ) -> anyhow::Result<()> {
            self.snaps
                .push(format!("{snap_name}: {}", commands.join(",")));
            Ok(())
        }
    }

    let seen_query: Arc<Mutex<String>> = Arc::default();
    let seen = seen_query.clone();
    let app = Router::new().route(
        "/api/v1/snaps/names",
        get(move |RawQuery(query): RawQuery| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = query.unwrap_or_default();
                Json(json!({
                    "_embedded": {
                        "clickindex:package": [
                            {"package_name": "inkscape", "version": "1.0",
                             "summary": "vector drawing",
                             "apps": ["inkscape"]},
                            {"package_name": "plain", "version": "1"}
                        ]
                    }
                }))
            }
        }),
    );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let (names, adder) = store
        .write_catalogs(Vec::new(), Recorder::default())
        .await
        .unwrap();
    assert_eq!(String::from_utf8(names).unwrap(), "inkscape\nplain\n");
    assert_eq!(adder.snaps, vec!["inkscape: inkscape".to_string()]);
    assert!(seen_query.lock().unwrap().contains("confinement=strict"));
}

#[tokio::test]
async fn connectivity_check_probes_api_and_cdn() {
    let base_holder: Arc<Mutex<String>> = Arc::default();
    let holder = base_holder.clone();
    let app = Router::new()
        .route(
            "/v2/snaps/info/core",
            get(move || {
                let holder = holder.clone();
                async move {
                    let base = holder.lock().unwrap().clone();
                    Json(json!({
                        "channel-map": [{
                            "download": {"url": format!("{base}cdn/core.snap")}
                        }]
                    }))
                }
            }),
        )
        .route("/cdn/core.snap", get(|| async { "blob" }));
    let base = serve(app).await;
    *base_holder.lock().unwrap() = base.clone();
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);

    let status = store.connectivity_check().await.unwrap();
    assert_eq!(status.get("127.0.0.1"), Some(&true));
}

#[tokio::test]
async fn decorated_info_consults_orders() {
    let app = Router::new()
        .route(
            "/v2/snaps/info/{name}",
            get(|Path(name): Path<String>| async move {
                let mut body = info_body(&name, "paid-id", 2);
                body["snap"]["prices"] = json!({"USD": "2.99"});
                Json(body)
            }),
        )
        .route(
            "/api/v1/snaps/purchases/orders",
            get(|| async {
                Json(json!({"orders": [{"snap_id": "paid-id", "state": "Complete"}]}))
            }),
        );
    let base = serve(app).await;
    let work = TempDir::new().unwrap();
    let store = test_store(&base, &work);
    let user = UserCredentials::new("store|root", vec![]);

    let info = store.snap_info("paid", Some(&user)).await.unwrap();
    assert!(info.paid());
    // the order on file means no further buying is needed
    assert!(!info.must_buy);
}
