//! In-process router over a memory store, with token minting.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use call_controller::config::Config;
use call_controller::routes::{self, AppState};
use call_test_utils::fixtures::TestStore;
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

pub const TEST_SECRET: &str = "call-controller-test-secret-0123456789";

pub struct TestApp {
    pub store: TestStore,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let store = TestStore::new();
        let vars = HashMap::from([
            ("CC_AUTH_SECRET".to_string(), TEST_SECRET.to_string()),
            ("CC_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ]);
        let config = Config::from_vars(&vars).expect("test config");
        // A recorder that is never installed globally; its handle still renders.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let state = Arc::new(AppState::new(store.shared(), config));
        Self {
            store,
            router: routes::build_routes(state, metrics_handle),
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }

    /// `POST /v1/calls/end` with an optional bearer token and a raw body.
    pub async fn end_call(
        &self,
        token: Option<&str>,
        body: &str,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/calls/end")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A token for `sub`, valid for an hour.
pub fn token_for(sub: &str) -> String {
    sign(&json!({ "sub": sub, "iat": now_secs(), "exp": now_secs() + 3600 }), TEST_SECRET)
}

pub fn sign(claims: &Value, secret: &str) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

pub fn end_body(room_id: &str) -> String {
    json!({ "roomId": room_id }).to_string()
}
