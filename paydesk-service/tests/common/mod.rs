//! Common test utilities for paydesk-service integration tests.
//!
//! Every test drives the full router against the in-memory store, so no
//! database is required.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, NaiveDate, Utc};
use http_body_util::BodyExt;
use paydesk_service::config::PaydeskConfig;
use paydesk_service::services::{FeeStore, MemoryStore, SandboxGateway};
use paydesk_service::{build_router, AppState};
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use tower::util::ServiceExt;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("warn,paydesk_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Identity forwarded by the BFF.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub role: &'static str,
    pub school_id: Option<String>,
    pub impersonation_token: Option<String>,
}

impl Caller {
    pub fn super_admin() -> Self {
        Self {
            user_id: "platform-admin".to_string(),
            role: "SUPER_ADMIN",
            school_id: None,
            impersonation_token: None,
        }
    }

    pub fn in_school(user_id: &str, role: &'static str, school_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role,
            school_id: Some(school_id.to_string()),
            impersonation_token: None,
        }
    }

    pub fn impersonating(token: &str) -> Self {
        Self {
            user_id: String::new(),
            role: "",
            school_id: None,
            impersonation_token: Some(token.to_string()),
        }
    }
}

/// Test application wrapper.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<SandboxGateway>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
    pub content_type: Option<String>,
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(PaydeskConfig::in_memory())
}

pub fn spawn_app_with_callback_secret(secret: &str) -> TestApp {
    let mut config = PaydeskConfig::in_memory();
    config.gateway.callback_secret = Some(Secret::new(secret.to_string()));
    spawn_app_with(config)
}

pub fn spawn_app_with(config: PaydeskConfig) -> TestApp {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(SandboxGateway::new());

    let mut state = AppState::with_store(store.clone() as Arc<dyn FeeStore>, &config);
    state.gateway = gateway.clone();

    TestApp {
        router: build_router(state),
        store,
        gateway,
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn due_in(days: i64) -> String {
    (today() + Duration::days(days)).to_string()
}

impl TestApp {
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        caller: Option<&Caller>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            if let Some(token) = &caller.impersonation_token {
                builder = builder.header("X-Impersonation-Token", token.as_str());
            } else {
                builder = builder
                    .header("X-User-ID", caller.user_id.as_str())
                    .header("X-User-Role", caller.role);
                if let Some(school_id) = &caller.school_id {
                    builder = builder.header("X-School-ID", school_id.as_str());
                }
            }
        }

        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes).to_string();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        TestResponse {
            status,
            body,
            text,
            content_type,
        }
    }

    pub async fn get(&self, uri: &str, caller: &Caller) -> TestResponse {
        self.request("GET", uri, Some(caller), None).await
    }

    pub async fn post(&self, uri: &str, caller: &Caller, body: Value) -> TestResponse {
        self.request("POST", uri, Some(caller), Some(body)).await
    }
}

/// A school with a principal, a bursar, an active period and one class.
pub struct School {
    pub school_id: String,
    pub principal: Caller,
    pub second_principal: Caller,
    pub bursar: Caller,
    pub period_id: String,
    pub class_id: String,
}

impl School {
    pub fn parent(&self, user_id: &str) -> Caller {
        Caller::in_school(user_id, "PARENT", &self.school_id)
    }
}

pub async fn create_school(app: &TestApp, code: &str) -> School {
    let response = app
        .post(
            "/admin/schools",
            &Caller::super_admin(),
            json!({ "name": format!("{} Academy", code), "code": code }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    let school_id = response.body["school_id"].as_str().unwrap().to_string();

    let principal = Caller::in_school("principal-1", "PRINCIPAL", &school_id);
    let second_principal = Caller::in_school("principal-2", "PRINCIPAL", &school_id);
    let bursar = Caller::in_school("bursar-1", "BURSAR", &school_id);

    let response = app
        .post(
            "/periods",
            &principal,
            json!({ "term": "Term 1", "academic_year": 2026 }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    let period_id = response.body["period_id"].as_str().unwrap().to_string();

    let response = app
        .post(&format!("/periods/{}/activate", period_id), &principal, json!({}))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);

    let class_id = create_class(app, &principal, "Grade 4").await;

    School {
        school_id,
        principal,
        second_principal,
        bursar,
        period_id,
        class_id,
    }
}

pub async fn create_class(app: &TestApp, caller: &Caller, name: &str) -> String {
    let response = app.post("/classes", caller, json!({ "name": name })).await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    response.body["class_id"].as_str().unwrap().to_string()
}

pub async fn create_student(
    app: &TestApp,
    school: &School,
    class_id: &str,
    admission_number: &str,
    parent_user_id: Option<&str>,
) -> String {
    let response = app
        .post(
            "/students",
            &school.bursar,
            json!({
                "class_id": class_id,
                "admission_number": admission_number,
                "first_name": "Amani",
                "last_name": admission_number,
                "parent_user_id": parent_user_id,
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    response.body["student_id"].as_str().unwrap().to_string()
}

pub async fn create_fee(
    app: &TestApp,
    school: &School,
    name: &str,
    amount: i64,
    class_id: Option<&str>,
) -> String {
    let response = app
        .post(
            "/fee-structures",
            &school.bursar,
            json!({
                "academic_period_id": school.period_id,
                "class_id": class_id,
                "name": name,
                "amount": amount.to_string(),
                "category": "TUITION",
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    response.body["fee_structure_id"].as_str().unwrap().to_string()
}

/// Manually raise a single-item invoice and return its id.
pub async fn create_invoice(app: &TestApp, school: &School, student_id: &str, amount: i64) -> String {
    let response = app
        .post(
            "/invoices",
            &school.bursar,
            json!({
                "student_id": student_id,
                "academic_period_id": school.period_id,
                "due_date": due_in(30),
                "items": [
                    { "description": "Tuition", "amount": amount.to_string(), "category": "TUITION" }
                ],
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    response.body["invoice_id"].as_str().unwrap().to_string()
}

/// Parse a JSON decimal that may be serialized as a string or a number.
pub fn amount(value: &Value) -> rust_decimal::Decimal {
    match value {
        Value::String(s) => s.parse().unwrap(),
        Value::Number(n) => n.to_string().parse().unwrap(),
        other => panic!("not an amount: {}", other),
    }
}
