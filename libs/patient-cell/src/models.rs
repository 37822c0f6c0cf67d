use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub id: Uuid,
    pub hn: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: NaiveDate,
    pub gender: String,
    pub national_id: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub allergies: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Whole years on `date`.
    pub fn age_on(&self, date: NaiveDate) -> Option<u32> {
        let mut years = date.year() - self.dob.year();
        if (date.month(), date.day()) < (self.dob.month(), self.dob.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medicine {
    pub name_thai: String,
    pub name_english: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub id: Uuid,
    pub icd10_code: String,
    pub description: Option<String>,
    pub diagnosis_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prescription {
    pub id: Uuid,
    pub quantity: i32,
    pub usage_instruction: Option<String>,
    pub medicine: Option<Medicine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentPlan {
    pub id: Uuid,
    pub plan_details: String,
    pub duration: Option<String>,
    pub follow_up_date: Option<NaiveDate>,
}

/// One past visit as shown on the patient's history. The status is kept as
/// the stored text; this view never drives transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisitHistory {
    pub id: Uuid,
    pub visit_date: NaiveDate,
    pub status: String,
    pub chief_complaint: Option<String>,
    pub queue_number: Option<i32>,
    #[serde(default)]
    pub diagnoses: Vec<Diagnosis>,
    #[serde(default)]
    pub prescriptions: Vec<Prescription>,
    #[serde(default)]
    pub treatment_plans: Vec<TreatmentPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientWithVisits {
    #[serde(flatten)]
    pub patient: Patient,
    #[serde(default)]
    pub visits: Vec<VisitHistory>,
}

impl PatientWithVisits {
    pub fn latest_visit(&self) -> Option<&VisitHistory> {
        self.visits.iter().max_by_key(|v| v.visit_date)
    }

    pub fn upcoming_follow_ups(&self, from: NaiveDate) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .visits
            .iter()
            .flat_map(|v| v.treatment_plans.iter())
            .filter_map(|p| p.follow_up_date)
            .filter(|d| *d >= from)
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifiedPatient {
    pub patient_id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientAccount {
    pub id: Uuid,
    pub user_id: String,
    pub patient_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VerifySignupRequest {
    pub national_id: String,
    pub dob: String,
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkAccountRequest {
    pub national_id: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
