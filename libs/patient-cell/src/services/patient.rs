use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use shared_database::{BackendGateway, Order, SelectQuery};

use crate::error::PatientError;
use crate::models::PatientWithVisits;

pub const PATIENTS_TABLE: &str = "patients";

const DETAIL_COLUMNS: &str = "*, \
    visits (id, visit_date, status, chief_complaint, queue_number, \
        diagnoses (id, icd10_code, description, diagnosis_type), \
        prescriptions (id, quantity, usage_instruction, medicine:medicines (name_thai, name_english)), \
        treatment_plans (id, plan_details, duration, follow_up_date))";

/// Read side of the patient record: demographics with full visit history.
#[derive(Clone)]
pub struct PatientService {
    gateway: Arc<dyn BackendGateway>,
}

impl PatientService {
    pub fn new(gateway: Arc<dyn BackendGateway>) -> Self {
        Self { gateway }
    }

    pub fn detail_query(patient_id: Uuid) -> SelectQuery {
        SelectQuery::from(PATIENTS_TABLE)
            .columns(DETAIL_COLUMNS)
            .eq("id", patient_id.to_string())
            .order(Order::desc("visit_date").on_table("visits"))
    }

    /// The patient with visits newest first, each carrying its diagnoses,
    /// prescriptions and treatment plans.
    pub async fn get_patient_detail(
        &self,
        patient_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<PatientWithVisits, PatientError> {
        debug!("Fetching patient detail for {}", patient_id);

        let row = self
            .gateway
            .select_maybe_single(&Self::detail_query(patient_id), auth_token)
            .await?
            .ok_or_else(|| PatientError::NotFound(format!("Patient {} not found", patient_id)))?;

        let mut detail: PatientWithVisits = serde_json::from_value(row)?;
        // In-memory backends ignore embedded ordering.
        detail.visits.sort_by(|a, b| b.visit_date.cmp(&a.visit_date));
        Ok(detail)
    }
}
