use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::query::{SelectQuery, UpdateQuery};

/// Row and procedure access to the managed backend.
///
/// `auth_token` is the caller's bearer token; it is forwarded so the backend's
/// row-level security sees the real user. `None` falls back to the anonymous key.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Ordered rows matching the query. An empty result is not an error.
    async fn select(&self, query: &SelectQuery, auth_token: Option<&str>) -> Result<Vec<Value>, GatewayError>;

    /// At most one row. More than one match is `GatewayError::MultipleRows`.
    async fn select_maybe_single(
        &self,
        query: &SelectQuery,
        auth_token: Option<&str>,
    ) -> Result<Option<Value>, GatewayError> {
        let mut rows = self.select(query, auth_token).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => Err(GatewayError::MultipleRows { table: query.table.clone(), count }),
        }
    }

    /// Inserts one row and returns it with generated id and timestamps.
    async fn insert(&self, table: &str, row: Value, auth_token: Option<&str>) -> Result<Value, GatewayError>;

    /// Updates the rows matching `query` and returns the first updated row.
    /// Matching nothing is `GatewayError::NotFound`.
    async fn update(&self, query: &UpdateQuery, values: Value, auth_token: Option<&str>) -> Result<Value, GatewayError>;

    /// Calls a privileged stored procedure with named parameters.
    async fn rpc(&self, function: &str, params: Value, auth_token: Option<&str>) -> Result<Value, GatewayError>;
}
