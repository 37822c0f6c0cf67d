use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_database::{BackendGateway, CacheKey, QueryCache, SelectQuery};
use shared_models::auth::User;
use shared_utils::validation::{digits_only, InputValidator};

use crate::error::PatientError;
use crate::models::{PatientAccount, VerifiedPatient};

pub const PATIENT_ACCOUNTS_TABLE: &str = "patient_accounts";
pub const ACCOUNT_CACHE: &str = "patient-account";

const VERIFY_FOR_SIGNUP_RPC: &str = "verify_patient_for_signup";
const VERIFY_BY_NATIONAL_ID_RPC: &str = "verify_patient_by_national_id";

pub fn account_key(user_id: &str) -> CacheKey {
    CacheKey::new(ACCOUNT_CACHE).param(user_id)
}

/// Identity verification against the patient register and the link between
/// an auth user and their patient record.
#[derive(Clone)]
pub struct AccountService {
    gateway: Arc<dyn BackendGateway>,
    cache: QueryCache,
    validator: InputValidator,
}

impl AccountService {
    pub fn new(gateway: Arc<dyn BackendGateway>, cache: QueryCache) -> Self {
        Self {
            gateway,
            cache,
            validator: InputValidator::new(),
        }
    }

    /// Confirms that national ID, birth date and phone belong to one patient
    /// before a self-service account is created.
    pub async fn verify_patient_for_signup(
        &self,
        national_id: &str,
        dob: &str,
        phone: &str,
    ) -> Result<VerifiedPatient, PatientError> {
        let national_id = national_id.trim();
        let phone = digits_only(phone);

        if national_id.is_empty() || dob.trim().is_empty() || phone.is_empty() {
            return Err(PatientError::Validation(
                "National ID, date of birth and phone are required".to_string(),
            ));
        }
        if !self.validator.is_national_id(national_id) {
            return Err(PatientError::Validation("National ID must be 13 digits".to_string()));
        }
        let Some(dob) = self.validator.parse_date(dob) else {
            return Err(PatientError::Validation("Date of birth must be YYYY-MM-DD".to_string()));
        };
        if !self.validator.is_phone(&phone) {
            return Err(PatientError::Validation("Phone number must be 9 or 10 digits".to_string()));
        }

        let params = json!({
            "p_national_id": national_id,
            "p_dob": dob,
            "p_phone": phone,
        });
        let result = self.gateway.rpc(VERIFY_FOR_SIGNUP_RPC, params, None).await?;

        let verified = match result {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            Value::Object(_) => result,
            _ => {
                warn!("Signup verification found no matching patient");
                return Err(PatientError::NotFound(
                    "No patient matches the given national ID, date of birth and phone".to_string(),
                ));
            }
        };

        Ok(serde_json::from_value(verified)?)
    }

    /// Looks up a patient id by national ID alone.
    pub async fn verify_patient_by_national_id(
        &self,
        national_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Uuid, PatientError> {
        let national_id = national_id.trim();
        if !self.validator.is_national_id(national_id) {
            return Err(PatientError::Validation("National ID must be 13 digits".to_string()));
        }

        let result = self
            .gateway
            .rpc(VERIFY_BY_NATIONAL_ID_RPC, json!({ "p_national_id": national_id }), auth_token)
            .await?;

        match result {
            Value::Null => Err(PatientError::NotFound(
                "Patient not found, check the national ID".to_string(),
            )),
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Links the signed-in user to the patient with `national_id`.
    pub async fn link_account(
        &self,
        user: &User,
        national_id: &str,
        auth_token: Option<&str>,
    ) -> Result<PatientAccount, PatientError> {
        let patient_id = self.verify_patient_by_national_id(national_id, auth_token).await?;

        let row = json!({
            "user_id": user.id,
            "patient_id": patient_id,
        });
        let inserted = self
            .gateway
            .insert(PATIENT_ACCOUNTS_TABLE, row, auth_token)
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    PatientError::Conflict(format!("User {} is already linked to a patient", user.id))
                } else {
                    PatientError::from(e)
                }
            })?;

        self.cache.invalidate(&CacheKey::new(ACCOUNT_CACHE)).await;
        info!("Linked user {} to patient {}", user.id, patient_id);

        Ok(serde_json::from_value(inserted)?)
    }

    /// The user's link, if any.
    pub async fn get_patient_account(
        &self,
        user_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Option<PatientAccount>, PatientError> {
        let query = SelectQuery::from(PATIENT_ACCOUNTS_TABLE).eq("user_id", user_id);
        let gateway = Arc::clone(&self.gateway);

        self.cache
            .get_or_fetch(&account_key(user_id), || async move {
                let row = gateway.select_maybe_single(&query, auth_token).await?;
                debug!("Patient account lookup returned {}", if row.is_some() { "a link" } else { "nothing" });
                row.map(serde_json::from_value::<PatientAccount>)
                    .transpose()
                    .map_err(PatientError::from)
            })
            .await
    }
}
