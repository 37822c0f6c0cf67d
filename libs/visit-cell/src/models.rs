use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use shared_database::ChangeEventKind;

use crate::error::VisitError;
use crate::services::transition;

/// Where a visit is in the clinic workflow. Serialized by variant name, e.g. `"InQueue"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VisitStatus {
    Registered,
    InQueue,
    VitalSigns,
    WaitingForDoctor,
    InConsultation,
    Diagnosing,
    Ordering,
    OrderConfirmed,
    PerformingProcedure,
    ProcedureCompleted,
    AwaitingPayment,
    PaymentProcessed,
    Dispensing,
    Completed,
}

impl VisitStatus {
    /// Workflow order. A status may only be replaced by one later in this list.
    pub const ALL: [VisitStatus; 14] = [
        VisitStatus::Registered,
        VisitStatus::InQueue,
        VisitStatus::VitalSigns,
        VisitStatus::WaitingForDoctor,
        VisitStatus::InConsultation,
        VisitStatus::Diagnosing,
        VisitStatus::Ordering,
        VisitStatus::OrderConfirmed,
        VisitStatus::PerformingProcedure,
        VisitStatus::ProcedureCompleted,
        VisitStatus::AwaitingPayment,
        VisitStatus::PaymentProcessed,
        VisitStatus::Dispensing,
        VisitStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Registered => "Registered",
            VisitStatus::InQueue => "InQueue",
            VisitStatus::VitalSigns => "VitalSigns",
            VisitStatus::WaitingForDoctor => "WaitingForDoctor",
            VisitStatus::InConsultation => "InConsultation",
            VisitStatus::Diagnosing => "Diagnosing",
            VisitStatus::Ordering => "Ordering",
            VisitStatus::OrderConfirmed => "OrderConfirmed",
            VisitStatus::PerformingProcedure => "PerformingProcedure",
            VisitStatus::ProcedureCompleted => "ProcedureCompleted",
            VisitStatus::AwaitingPayment => "AwaitingPayment",
            VisitStatus::PaymentProcessed => "PaymentProcessed",
            VisitStatus::Dispensing => "Dispensing",
            VisitStatus::Completed => "Completed",
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            VisitStatus::Registered => 0,
            VisitStatus::InQueue => 1,
            VisitStatus::VitalSigns => 2,
            VisitStatus::WaitingForDoctor => 3,
            VisitStatus::InConsultation => 4,
            VisitStatus::Diagnosing => 5,
            VisitStatus::Ordering => 6,
            VisitStatus::OrderConfirmed => 7,
            VisitStatus::PerformingProcedure => 8,
            VisitStatus::ProcedureCompleted => 9,
            VisitStatus::AwaitingPayment => 10,
            VisitStatus::PaymentProcessed => 11,
            VisitStatus::Dispensing => 12,
            VisitStatus::Completed => 13,
        }
    }

    pub fn next(&self) -> Option<VisitStatus> {
        transition::next_status(*self)
    }

    pub fn station(&self) -> StationGroup {
        match self {
            VisitStatus::Registered | VisitStatus::InQueue => StationGroup::Registration,
            VisitStatus::VitalSigns | VisitStatus::WaitingForDoctor => StationGroup::Screening,
            VisitStatus::InConsultation
            | VisitStatus::Diagnosing
            | VisitStatus::Ordering
            | VisitStatus::OrderConfirmed => StationGroup::Consultation,
            VisitStatus::PerformingProcedure | VisitStatus::ProcedureCompleted => StationGroup::Treatment,
            VisitStatus::AwaitingPayment
            | VisitStatus::PaymentProcessed
            | VisitStatus::Dispensing
            | VisitStatus::Completed => StationGroup::Finance,
        }
    }

    /// Whether the doctor can open the consultation screen for this visit.
    pub fn allows_consultation(&self) -> bool {
        (VisitStatus::WaitingForDoctor.rank()..=VisitStatus::OrderConfirmed.rank()).contains(&self.rank())
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitStatus {
    type Err = VisitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VisitStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| VisitError::Validation(format!("Unknown visit status: {}", s)))
    }
}

/// Stations of the clinic floor; each status belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationGroup {
    Registration,
    Screening,
    Consultation,
    Treatment,
    Finance,
}

impl StationGroup {
    pub const ALL: [StationGroup; 5] = [
        StationGroup::Registration,
        StationGroup::Screening,
        StationGroup::Consultation,
        StationGroup::Treatment,
        StationGroup::Finance,
    ];

    pub fn statuses(&self) -> Vec<VisitStatus> {
        VisitStatus::ALL
            .iter()
            .copied()
            .filter(|status| status.station() == *self)
            .collect()
    }
}

impl FromStr for StationGroup {
    type Err = VisitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "registration" => Ok(StationGroup::Registration),
            "screening" => Ok(StationGroup::Screening),
            "consultation" => Ok(StationGroup::Consultation),
            "treatment" => Ok(StationGroup::Treatment),
            "finance" => Ok(StationGroup::Finance),
            other => Err(VisitError::Validation(format!("Unknown station: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_pressure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl VitalSigns {
    pub fn is_empty(&self) -> bool {
        self.blood_pressure.is_none()
            && self.pulse.is_none()
            && self.temperature.is_none()
            && self.weight.is_none()
            && self.height.is_none()
    }
}

/// Patient columns embedded in visit reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub id: Uuid,
    pub hn: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: NaiveDate,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub allergies: Vec<String>,
}

impl PatientSummary {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn has_allergies(&self) -> bool {
        !self.allergies.is_empty()
    }

    /// Completed years of age on `date`.
    pub fn age_on(&self, date: NaiveDate) -> i32 {
        let mut age = date.year() - self.dob.year();
        if (date.month(), date.day()) < (self.dob.month(), self.dob.day()) {
            age -= 1;
        }
        age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub patient_id: Uuid,
    #[serde(default)]
    pub doctor_id: Option<Uuid>,
    pub visit_date: NaiveDate,
    #[serde(default)]
    pub queue_number: Option<i32>,
    #[serde(default)]
    pub vital_signs: Option<VitalSigns>,
    #[serde(default)]
    pub chief_complaint: Option<String>,
    #[serde(default)]
    pub physical_exam_note: Option<String>,
    pub status: VisitStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patients: Option<PatientSummary>,
}

impl Visit {
    pub fn has_vital_signs(&self) -> bool {
        self.vital_signs.as_ref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVisitRequest {
    pub patient_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateVisitStatusRequest {
    pub status: VisitStatus,
}

/// Filters for a visit listing. `None` means unfiltered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisitQuery {
    pub date: Option<NaiveDate>,
    pub statuses: Option<Vec<VisitStatus>>,
}

impl VisitQuery {
    pub fn on(date: NaiveDate) -> Self {
        Self { date: Some(date), statuses: None }
    }

    /// Statuses are kept in workflow order without repeats, so equivalent
    /// filters read and cache the same rows.
    pub fn with_statuses(mut self, statuses: Vec<VisitStatus>) -> Self {
        self.statuses = Some(canonical_statuses(statuses));
        self
    }
}

pub fn canonical_statuses(mut statuses: Vec<VisitStatus>) -> Vec<VisitStatus> {
    statuses.sort_by_key(VisitStatus::rank);
    statuses.dedup();
    statuses
}

/// Query string of `GET /visits`: `?date=2026-10-17&status=InQueue,VitalSigns`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VisitListParams {
    pub date: Option<NaiveDate>,
    pub status: Option<String>,
}

impl TryFrom<VisitListParams> for VisitQuery {
    type Error = VisitError;

    fn try_from(params: VisitListParams) -> Result<Self, Self::Error> {
        let statuses = match params.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(canonical_statuses(
                raw.split(',')
                    .map(|s| s.trim().parse::<VisitStatus>())
                    .collect::<Result<Vec<_>, _>>()?,
            )),
        };
        Ok(VisitQuery { date: params.date, statuses })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueParams {
    pub station: Option<String>,
}

/// A visit as shown on the queue board, with the derived fields the UI needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitView {
    #[serde(flatten)]
    pub visit: Visit,
    pub next_status: Option<VisitStatus>,
    pub station: StationGroup,
    pub allows_consultation: bool,
    pub has_allergies: bool,
    pub patient_age: Option<i32>,
}

impl VisitView {
    pub fn new(visit: Visit, today: NaiveDate) -> Self {
        let status = visit.status;
        let patient = visit.patients.as_ref();
        Self {
            next_status: status.next(),
            station: status.station(),
            allows_consultation: status.allows_consultation(),
            has_allergies: patient.is_some_and(PatientSummary::has_allergies),
            patient_age: patient.map(|p| p.age_on(today)),
            visit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationCount {
    pub station: StationGroup,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueBoard {
    pub date: NaiveDate,
    pub station: Option<StationGroup>,
    pub entries: Vec<VisitView>,
    /// Visits per station over the whole day, regardless of the station filter.
    pub counts: Vec<StationCount>,
    pub total: usize,
}

/// Sent to live queue consumers after the cached day view was invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInvalidation {
    pub date: NaiveDate,
    pub table: String,
    pub event: ChangeEventKind,
    pub received_at: DateTime<Utc>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(dob: &str, allergies: serde_json::Value) -> PatientSummary {
        serde_json::from_value(json!({
            "id": "0b9d7a5e-4a53-4c33-9d64-2f1c8a3e7d10",
            "hn": "HN000001",
            "first_name": "Malee",
            "last_name": "Srisuk",
            "dob": dob,
            "allergies": allergies
        }))
        .unwrap()
    }

    #[test]
    fn status_serializes_by_name() {
        assert_eq!(serde_json::to_value(VisitStatus::WaitingForDoctor).unwrap(), json!("WaitingForDoctor"));
        let parsed: VisitStatus = serde_json::from_value(json!("PaymentProcessed")).unwrap();
        assert_eq!(parsed, VisitStatus::PaymentProcessed);
        assert_eq!("Dispensing".parse::<VisitStatus>().unwrap(), VisitStatus::Dispensing);
        assert!("dispensing".parse::<VisitStatus>().is_err());
    }

    #[test]
    fn stations_partition_all_statuses() {
        let mut covered: Vec<VisitStatus> = StationGroup::ALL.iter().flat_map(|s| s.statuses()).collect();
        assert_eq!(covered.len(), VisitStatus::ALL.len());
        covered.sort_by_key(|s| s.rank());
        assert_eq!(covered, VisitStatus::ALL.to_vec());
        assert_eq!(StationGroup::Treatment.statuses(), vec![
            VisitStatus::PerformingProcedure,
            VisitStatus::ProcedureCompleted,
        ]);
    }

    #[test]
    fn consultation_window() {
        let allowed: Vec<VisitStatus> = VisitStatus::ALL
            .iter()
            .copied()
            .filter(VisitStatus::allows_consultation)
            .collect();
        assert_eq!(allowed, vec![
            VisitStatus::WaitingForDoctor,
            VisitStatus::InConsultation,
            VisitStatus::Diagnosing,
            VisitStatus::Ordering,
            VisitStatus::OrderConfirmed,
        ]);
    }

    #[test]
    fn age_counts_completed_years() {
        let patient = summary("1990-10-18", json!([]));
        let day_before = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let birthday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(patient.age_on(day_before), 35);
        assert_eq!(patient.age_on(birthday), 36);
    }

    #[test]
    fn null_allergies_mean_none() {
        assert!(!summary("1990-01-01", json!(null)).has_allergies());
        assert!(summary("1990-01-01", json!(["Aspirin"])).has_allergies());
    }

    #[test]
    fn list_params_parse_status_csv() {
        let query = VisitQuery::try_from(VisitListParams {
            date: None,
            status: Some("InQueue, VitalSigns".to_string()),
        })
        .unwrap();
        assert_eq!(query.statuses, Some(vec![VisitStatus::InQueue, VisitStatus::VitalSigns]));

        let empty = VisitQuery::try_from(VisitListParams::default()).unwrap();
        assert_eq!(empty, VisitQuery::default());

        assert!(VisitQuery::try_from(VisitListParams {
            date: None,
            status: Some("InQueue,Lost".to_string()),
        })
        .is_err());
    }

    #[test]
    fn missing_vitals_are_none() {
        let visit: Visit = serde_json::from_value(json!({
            "id": "6f1c1c1e-3c1b-4c1e-9b1a-1a2b3c4d5e6f",
            "patient_id": "0b9d7a5e-4a53-4c33-9d64-2f1c8a3e7d10",
            "visit_date": "2026-10-17",
            "queue_number": null,
            "vital_signs": null,
            "status": "InQueue",
            "created_at": "2026-10-17T01:00:00Z",
            "updated_at": "2026-10-17T01:00:00Z"
        }))
        .unwrap();
        assert!(!visit.has_vital_signs());
        assert!(visit.patients.is_none());

        let view = VisitView::new(visit, NaiveDate::from_ymd_opt(2026, 10, 17).unwrap());
        assert_eq!(view.next_status, Some(VisitStatus::VitalSigns));
        assert_eq!(view.station, StationGroup::Registration);
        assert!(!view.has_allergies);
        assert_eq!(view.patient_age, None);
    }
}
