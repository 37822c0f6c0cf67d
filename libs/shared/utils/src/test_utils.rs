use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{
    BackendGateway, BroadcastChangeFeed, ChangeEvent, ChangeEventKind, GatewayError, SelectQuery,
    UpdateQuery,
};
use shared_models::auth::User;

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
        }
    }
}

impl TestConfig {
    pub fn with_url(url: &str) -> Self {
        Self { supabase_url: url.to_string(), ..Self::default() }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            // Tests run on the clinic's clock, not the CI machine's.
            clinic_utc_offset_minutes: Some(7 * 60),
            ..AppConfig::default()
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub email: String,
    pub role: String,
    pub full_name: Option<String>,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: "test@example.com".to_string(),
            role: "authenticated".to_string(),
            full_name: None,
        }
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
            full_name: None,
        }
    }

    pub fn staff(email: &str) -> Self {
        Self::new(email, "authenticated")
    }

    pub fn patient(email: &str) -> Self {
        Self::new(email, "authenticated")
    }

    pub fn with_full_name(mut self, full_name: &str) -> Self {
        self.full_name = Some(full_name.to_string());
        self
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            role: Some(self.role.clone()),
            metadata: self.full_name.as_ref().map(|name| json!({ "full_name": name })),
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let payload = json!({
            "sub": user.id,
            "email": user.email,
            "role": user.role,
            "aud": "authenticated",
            "user_metadata": { "full_name": user.full_name },
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }
}

pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn session_response(user_id: &str, email: &str) -> Value {
        json!({
            "access_token": "header.payload.signature",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-token",
            "user": {
                "id": user_id,
                "email": email,
                "role": "authenticated",
                "user_metadata": { "full_name": "Test User" },
                "created_at": "2026-01-01T00:00:00Z"
            }
        })
    }

    pub fn patient_response(patient_id: &str) -> Value {
        json!({
            "id": patient_id,
            "hn": "HN000123",
            "first_name": "Somchai",
            "last_name": "Jaidee",
            "dob": "1985-04-12",
            "gender": "male",
            "national_id": "1103700012345",
            "phone": "0812345678",
            "address": null,
            "allergies": ["Penicillin"],
            "created_at": "2026-01-01T00:00:00Z"
        })
    }

    pub fn visit_response(visit_id: &str, patient_id: &str, visit_date: &str, queue_number: i32, status: &str) -> Value {
        json!({
            "id": visit_id,
            "patient_id": patient_id,
            "doctor_id": null,
            "visit_date": visit_date,
            "queue_number": queue_number,
            "vital_signs": {},
            "chief_complaint": null,
            "physical_exam_note": null,
            "status": status,
            "created_at": format!("{}T01:00:00Z", visit_date),
            "updated_at": format!("{}T01:00:00Z", visit_date),
            "patients": {
                "id": patient_id,
                "hn": "HN000123",
                "first_name": "Somchai",
                "last_name": "Jaidee",
                "dob": "1985-04-12",
                "allergies": ["Penicillin"]
            }
        })
    }

    pub fn patient_account_response(user_id: &str, patient_id: &str) -> Value {
        json!({
            "id": Uuid::new_v4(),
            "user_id": user_id,
            "patient_id": patient_id,
            "created_at": "2026-01-01T00:00:00Z"
        })
    }

    pub fn verified_patient_response(patient_id: &str) -> Value {
        json!({
            "patient_id": patient_id,
            "first_name": "Somchai",
            "last_name": "Jaidee"
        })
    }

    pub fn error_response(message: &str, code: &str) -> Value {
        json!({
            "message": message,
            "code": code
        })
    }
}

type RpcHandler = Arc<dyn Fn(&Value) -> Result<Value, GatewayError> + Send + Sync>;

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Value>>,
    unique: HashMap<String, Vec<Vec<String>>>,
    forced_conflicts: HashMap<String, usize>,
}

/// Backend held in memory for service tests. Applies filters, ordering and
/// limits the way PostgREST does, enforces registered unique constraints, and
/// publishes every insert and update to an attached change feed.
///
/// Embedded resources in column lists are not resolved; rows are returned as stored.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    tables: Arc<Mutex<Tables>>,
    rpcs: Arc<Mutex<HashMap<String, RpcHandler>>>,
    feed: Option<BroadcastChangeFeed>,
    selects: Arc<AtomicUsize>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_change_feed(mut self, feed: BroadcastChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Rejects inserts that repeat the values of `columns` in an existing row.
    pub fn with_unique(self, table: &str, columns: &[&str]) -> Self {
        self.lock()
            .unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_rpc<F>(self, function: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, GatewayError> + Send + Sync + 'static,
    {
        self.rpcs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(function.to_string(), Arc::new(handler));
        self
    }

    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.lock().rows.entry(table.to_string()).or_default().extend(rows);
    }

    /// The next `count` inserts into `table` fail with a unique violation,
    /// as if a concurrent writer had won the race.
    pub fn force_conflicts(&self, table: &str, count: usize) {
        self.lock().forced_conflicts.insert(table.to_string(), count);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().rows.get(table).cloned().unwrap_or_default()
    }

    pub fn select_calls(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event).await;
        }
    }
}

fn conflict(table: &str, columns: &[String]) -> GatewayError {
    GatewayError::Conflict(format!(
        "duplicate key value violates unique constraint \"{}_{}_key\"",
        table,
        columns.join("_")
    ))
}

#[async_trait]
impl BackendGateway for InMemoryGateway {
    async fn select(&self, query: &SelectQuery, _auth_token: Option<&str>) -> Result<Vec<Value>, GatewayError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows(&query.table);
        Ok(query.apply(rows))
    }

    async fn insert(&self, table: &str, row: Value, _auth_token: Option<&str>) -> Result<Value, GatewayError> {
        let Value::Object(mut fields) = row else {
            return Err(GatewayError::Rejected { status: 400, message: "Row must be an object".to_string() });
        };

        let stored = {
            let mut tables = self.lock();

            if let Some(remaining) = tables.forced_conflicts.get_mut(table).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(conflict(table, &["forced".to_string()]));
            }

            let now = Utc::now().to_rfc3339();
            fields.entry("id").or_insert_with(|| json!(Uuid::new_v4().to_string()));
            fields.entry("created_at").or_insert_with(|| json!(now));
            fields.entry("updated_at").or_insert_with(|| json!(now));
            let candidate = Value::Object(fields);

            let existing = tables.rows.get(table).cloned().unwrap_or_default();
            for columns in tables.unique.get(table).cloned().unwrap_or_default() {
                let clash = existing.iter().any(|row| {
                    columns.iter().all(|c| {
                        let value = candidate.get(c).unwrap_or(&Value::Null);
                        !value.is_null() && row.get(c) == Some(value)
                    })
                });
                if clash {
                    return Err(conflict(table, &columns));
                }
            }

            tables.rows.entry(table.to_string()).or_default().push(candidate.clone());
            candidate
        };

        self.publish(ChangeEvent::new(table, ChangeEventKind::Insert, stored.clone())).await;
        Ok(stored)
    }

    async fn update(&self, query: &UpdateQuery, values: Value, _auth_token: Option<&str>) -> Result<Value, GatewayError> {
        if query.filters.is_empty() {
            return Err(GatewayError::Rejected {
                status: 400,
                message: format!("Refusing unfiltered update of {}", query.table),
            });
        }

        let changed: Vec<(Value, Value)> = {
            let mut tables = self.lock();
            let rows = tables.rows.entry(query.table.clone()).or_default();
            let now = Utc::now().to_rfc3339();
            rows.iter_mut()
                .filter(|row| query.matches(row))
                .map(|row| {
                    let old = row.clone();
                    if let (Value::Object(target), Value::Object(patch)) = (&mut *row, &values) {
                        for (key, value) in patch {
                            target.insert(key.clone(), value.clone());
                        }
                        target.insert("updated_at".to_string(), json!(now));
                    }
                    (old, row.clone())
                })
                .collect()
        };

        let Some((_, first)) = changed.first().cloned() else {
            return Err(GatewayError::NotFound(format!("No {} row matched the update", query.table)));
        };

        for (old, new) in changed {
            let mut event = ChangeEvent::new(query.table.clone(), ChangeEventKind::Update, new);
            event.old_record = old;
            self.publish(event).await;
        }
        Ok(first)
    }

    async fn rpc(&self, function: &str, params: Value, _auth_token: Option<&str>) -> Result<Value, GatewayError> {
        let handler = self
            .rpcs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(function)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Could not find the function public.{}", function)))?;
        handler(&params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use shared_database::{ChangeFeed, ChannelSpec, Order};

    #[test]
    fn test_config_creation() {
        let config = TestConfig::default();
        let app_config = config.to_app_config();

        assert_eq!(app_config.supabase_url, "http://localhost:54321");
        assert_eq!(app_config.supabase_anon_key, "test-anon-key");
        assert!(!app_config.supabase_jwt_secret.is_empty());
        assert_eq!(app_config.queue_number_max_attempts, 3);
    }

    #[test]
    fn test_user_creation() {
        let user = TestUser::staff("nurse@clinic.test").with_full_name("Nurse Joy");
        let user_model = user.to_user();

        assert_eq!(user_model.email, Some(user.email.clone()));
        assert_eq!(user_model.id, user.id);
        assert_eq!(user_model.full_name(), Some("Nurse Joy"));
    }

    #[tokio::test]
    async fn in_memory_gateway_orders_and_limits() {
        let gateway = InMemoryGateway::new();
        gateway.seed("visits", vec![
            json!({"id": "a", "queue_number": 2}),
            json!({"id": "b", "queue_number": null}),
            json!({"id": "c", "queue_number": 5}),
        ]);

        let query = SelectQuery::from("visits")
            .order(Order::desc("queue_number").nulls_last())
            .limit(1);
        let rows = gateway.select(&query, None).await.unwrap();

        assert_eq!(rows, vec![json!({"id": "c", "queue_number": 5})]);
        assert_eq!(gateway.select_calls(), 1);
    }

    #[tokio::test]
    async fn in_memory_gateway_enforces_unique_columns() {
        let gateway = InMemoryGateway::new().with_unique("patient_accounts", &["user_id"]);

        gateway.insert("patient_accounts", json!({"user_id": "u1", "patient_id": "p1"}), None).await.unwrap();
        let err = gateway
            .insert("patient_accounts", json!({"user_id": "u1", "patient_id": "p2"}), None)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(gateway.rows("patient_accounts").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_gateway_publishes_writes() {
        let feed = BroadcastChangeFeed::new();
        let gateway = InMemoryGateway::new().with_change_feed(feed.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        feed.subscribe(
            ChannelSpec::table("test", "visits"),
            shared_database::realtime::change_handler(move |event: ChangeEvent| {
                let sink = Arc::clone(&sink);
                async move { sink.lock().unwrap().push(event.kind) }
            }),
        )
        .await
        .unwrap();

        let row = gateway.insert("visits", json!({"status": "InQueue"}), None).await.unwrap();
        let id = row["id"].as_str().unwrap().to_string();
        gateway
            .update(&UpdateQuery::table("visits").eq("id", id.as_str()), json!({"status": "VitalSigns"}), None)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![ChangeEventKind::Insert, ChangeEventKind::Update]);

        let err = gateway
            .update(&UpdateQuery::table("visits").eq("id", "missing"), json!({"status": "Completed"}), None)
            .await
            .unwrap_err();
        assert_matches!(err, GatewayError::NotFound(_));
    }
}
