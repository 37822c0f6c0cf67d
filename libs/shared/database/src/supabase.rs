use async_trait::async_trait;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

use crate::error::{GatewayError, UNIQUE_VIOLATION};
use crate::gateway::BackendGateway;
use crate::query::{SelectQuery, UpdateQuery};

#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();

        let apikey = HeaderValue::from_str(&self.anon_key)
            .map_err(|_| GatewayError::Unauthorized("API key is not a valid header value".to_string()))?;
        headers.insert("apikey", apikey);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Anonymous calls authenticate as the anon role.
        let bearer = auth_token.unwrap_or(&self.anon_key);
        let authorization = HeaderValue::from_str(&format!("Bearer {}", bearer))
            .map_err(|_| GatewayError::Unauthorized("Bearer token is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, authorization);

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T, GatewayError>
    where T: DeserializeOwned {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    pub async fn request_with_headers<T>(&self, method: Method, path: &str,
                                         auth_token: Option<&str>, body: Option<Value>,
                                         extra_headers: Option<HeaderMap>)
                                         -> Result<T, GatewayError>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut headers = self.get_headers(auth_token)?;
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url)
            .headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);
            return Err(classify_error(status, &error_text));
        }

        let bytes = response.bytes().await?;
        // Procedures returning void answer with an empty body.
        if bytes.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice::<T>(&bytes)?)
    }

    /// Password grant against the auth service. Returns the session payload.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Value, GatewayError> {
        self.request(
            Method::POST,
            "/auth/v1/token?grant_type=password",
            None,
            Some(serde_json::json!({ "email": email, "password": password })),
        ).await
    }

    pub async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> Result<Value, GatewayError> {
        self.request(
            Method::POST,
            "/auth/v1/signup",
            None,
            Some(serde_json::json!({
                "email": email,
                "password": password,
                "data": { "full_name": full_name }
            })),
        ).await
    }

    pub async fn get_user_profile(&self, auth_token: &str) -> Result<Value, GatewayError> {
        self.request::<Value>(
            Method::GET,
            "/auth/v1/user",
            Some(auth_token),
            None,
        ).await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }

    fn representation_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", HeaderValue::from_static("return=representation"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }
}

#[async_trait]
impl BackendGateway for SupabaseClient {
    async fn select(&self, query: &SelectQuery, auth_token: Option<&str>) -> Result<Vec<Value>, GatewayError> {
        self.request(Method::GET, &query.path(), auth_token, None).await
    }

    async fn insert(&self, table: &str, row: Value, auth_token: Option<&str>) -> Result<Value, GatewayError> {
        let path = format!("/rest/v1/{}", table);
        let mut result: Vec<Value> = self.request_with_headers(
            Method::POST,
            &path,
            auth_token,
            Some(row),
            Some(Self::representation_headers()),
        ).await?;

        if result.is_empty() {
            return Err(GatewayError::Rejected {
                status: StatusCode::OK.as_u16(),
                message: format!("Insert into {} returned no row", table),
            });
        }
        Ok(result.swap_remove(0))
    }

    async fn update(&self, query: &UpdateQuery, values: Value, auth_token: Option<&str>) -> Result<Value, GatewayError> {
        if query.filters.is_empty() {
            return Err(GatewayError::Rejected {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message: format!("Refusing unfiltered update of {}", query.table),
            });
        }

        let mut result: Vec<Value> = self.request_with_headers(
            Method::PATCH,
            &query.path(),
            auth_token,
            Some(values),
            Some(Self::representation_headers()),
        ).await?;

        if result.is_empty() {
            return Err(GatewayError::NotFound(format!("No {} row matched the update", query.table)));
        }
        Ok(result.swap_remove(0))
    }

    async fn rpc(&self, function: &str, params: Value, auth_token: Option<&str>) -> Result<Value, GatewayError> {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, auth_token, Some(params)).await
    }
}

/// Maps a failed PostgREST / auth response to the error taxonomy.
pub fn classify_error(status: StatusCode, body: &str) -> GatewayError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(|m| m.as_str()))
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    if status == StatusCode::CONFLICT || code == UNIQUE_VIOLATION {
        return GatewayError::Conflict(message);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(message),
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        _ => GatewayError::Rejected { status: status.as_u16(), message },
    }
}
