use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{BackendGateway, CacheKey, Filter, Order, QueryCache, SelectQuery, UpdateQuery};

use crate::error::VisitError;
use crate::models::{
    canonical_statuses, QueueBoard, StationCount, StationGroup, Visit, VisitQuery, VisitStatus, VisitView,
};
use crate::services::calendar::ClinicCalendar;
use crate::services::transition::{next_status, validate_assignment};

pub const VISITS_TABLE: &str = "visits";
pub const VISITS_CACHE: &str = "visits";

const VISIT_COLUMNS: &str = "*, patients (id, hn, first_name, last_name, dob, allergies)";

/// Cache key of a visit listing: `visits / date|* / statuses|*`. The day
/// view invalidated by queue sync is the prefix `visits / date`.
pub fn visits_key(query: &VisitQuery) -> CacheKey {
    let date = query
        .date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "*".to_string());
    let statuses = match &query.statuses {
        Some(statuses) if !statuses.is_empty() => canonical_statuses(statuses.clone())
            .iter()
            .map(VisitStatus::as_str)
            .collect::<Vec<_>>()
            .join(","),
        _ => "*".to_string(),
    };
    CacheKey::new(VISITS_CACHE).param(date).param(statuses)
}

pub fn day_key(date: NaiveDate) -> CacheKey {
    CacheKey::new(VISITS_CACHE).param(date)
}

/// Whether `key` is a visit listing for a day before `today`.
pub fn is_past_day(key: &CacheKey, today: NaiveDate) -> bool {
    key.collection() == VISITS_CACHE
        && key
            .params()
            .first()
            .and_then(|date| date.parse::<NaiveDate>().ok())
            .is_some_and(|date| date < today)
}

#[derive(Clone)]
pub struct VisitService {
    gateway: Arc<dyn BackendGateway>,
    cache: QueryCache,
    calendar: ClinicCalendar,
    max_attempts: u32,
}

impl VisitService {
    pub fn new(
        gateway: Arc<dyn BackendGateway>,
        cache: QueryCache,
        calendar: ClinicCalendar,
        config: &AppConfig,
    ) -> Self {
        Self {
            gateway,
            cache,
            calendar,
            max_attempts: config.queue_number_max_attempts.max(1),
        }
    }

    pub fn calendar(&self) -> &ClinicCalendar {
        &self.calendar
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Visits with their patient summary, ordered by queue number.
    pub async fn list_visits(&self, query: &VisitQuery, auth_token: Option<&str>) -> Result<Vec<Visit>, VisitError> {
        let key = visits_key(query);
        let select = Self::list_select(query);
        let gateway = Arc::clone(&self.gateway);

        self.cache
            .get_or_fetch(&key, || async move {
                let rows = gateway.select(&select, auth_token).await?;
                debug!("Fetched {} visit rows", rows.len());
                rows.into_iter()
                    .map(serde_json::from_value::<Visit>)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(VisitError::from)
            })
            .await
    }

    /// Today's queue, optionally narrowed to one station. Counts always cover the whole day.
    pub async fn today_queue(&self, station: Option<StationGroup>, auth_token: Option<&str>) -> Result<QueueBoard, VisitError> {
        let today = self.calendar.today();
        let visits = self.list_visits(&VisitQuery::on(today), auth_token).await?;

        let counts = StationGroup::ALL
            .iter()
            .map(|group| StationCount {
                station: *group,
                count: visits.iter().filter(|v| v.status.station() == *group).count(),
            })
            .collect();
        let total = visits.len();

        let entries = visits
            .into_iter()
            .filter(|v| station.map_or(true, |s| v.status.station() == s))
            .map(|v| VisitView::new(v, today))
            .collect();

        Ok(QueueBoard { date: today, station, entries, counts, total })
    }

    pub async fn get_visit(&self, visit_id: Uuid, auth_token: Option<&str>) -> Result<Visit, VisitError> {
        let query = SelectQuery::from(VISITS_TABLE)
            .columns(VISIT_COLUMNS)
            .eq("id", visit_id.to_string());

        let row = self
            .gateway
            .select_maybe_single(&query, auth_token)
            .await?
            .ok_or_else(|| VisitError::NotFound(format!("Visit {} not found", visit_id)))?;

        Ok(serde_json::from_value(row)?)
    }

    /// Adds the patient to today's queue with the next queue number.
    pub async fn create_visit(&self, patient_id: Uuid, auth_token: Option<&str>) -> Result<Visit, VisitError> {
        let mut attempt = 1;
        loop {
            let today = self.calendar.today();
            let queue_number = self.next_queue_number(today, auth_token).await?;

            let row = json!({
                "patient_id": patient_id,
                "visit_date": today,
                "queue_number": queue_number,
                "status": VisitStatus::InQueue,
            });

            match self.gateway.insert(VISITS_TABLE, row, auth_token).await {
                Ok(stored) => {
                    let visit: Visit = serde_json::from_value(stored)?;
                    self.invalidate_visits().await;
                    info!("Queued patient {} as #{} for {}", patient_id, queue_number, today);
                    return Ok(visit);
                }
                Err(e) if e.is_conflict() && attempt < self.max_attempts => {
                    warn!(
                        "Queue number {} for {} was taken (attempt {}/{}), retrying",
                        queue_number, today, attempt, self.max_attempts
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Moves the visit to the next status of the workflow.
    pub async fn advance_visit(&self, visit_id: Uuid, auth_token: Option<&str>) -> Result<Visit, VisitError> {
        let current = self.get_visit(visit_id, auth_token).await?;
        let next = next_status(current.status).ok_or_else(|| {
            VisitError::Validation(format!("Visit {} is already {}", visit_id, current.status))
        })?;

        self.compare_and_set(visit_id, current.status, next, auth_token).await
    }

    /// Assigns an explicit later status, e.g. to enter the procedure branch.
    pub async fn update_visit_status(
        &self,
        visit_id: Uuid,
        status: VisitStatus,
        auth_token: Option<&str>,
    ) -> Result<Visit, VisitError> {
        let current = self.get_visit(visit_id, auth_token).await?;
        validate_assignment(current.status, status)?;

        self.compare_and_set(visit_id, current.status, status, auth_token).await
    }

    async fn next_queue_number(&self, date: NaiveDate, auth_token: Option<&str>) -> Result<i64, VisitError> {
        let query = SelectQuery::from(VISITS_TABLE)
            .columns("queue_number")
            .eq("visit_date", date.to_string())
            .filter(Filter::not_null("queue_number"))
            .order(Order::desc("queue_number").nulls_last())
            .limit(1);

        let max = self
            .gateway
            .select_maybe_single(&query, auth_token)
            .await?
            .and_then(|row| row.get("queue_number").and_then(Value::as_i64))
            .unwrap_or(0);

        Ok(max + 1)
    }

    // The update only applies while the row still has the status we read.
    async fn compare_and_set(
        &self,
        visit_id: Uuid,
        from: VisitStatus,
        to: VisitStatus,
        auth_token: Option<&str>,
    ) -> Result<Visit, VisitError> {
        let query = UpdateQuery::table(VISITS_TABLE)
            .eq("id", visit_id.to_string())
            .eq("status", from.as_str());

        let row = match self.gateway.update(&query, json!({ "status": to }), auth_token).await {
            Ok(row) => row,
            Err(e) if e.is_not_found() => {
                warn!("Visit {} left {} before it could be moved to {}", visit_id, from, to);
                return Err(VisitError::Conflict(format!(
                    "Visit {} is no longer {}, reload and try again",
                    visit_id, from
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let visit: Visit = serde_json::from_value(row)?;
        self.invalidate_visits().await;
        info!("Visit {} moved from {} to {}", visit_id, from, to);
        Ok(visit)
    }

    async fn invalidate_visits(&self) {
        self.cache.invalidate(&CacheKey::new(VISITS_CACHE)).await;
    }

    fn list_select(query: &VisitQuery) -> SelectQuery {
        let mut select = SelectQuery::from(VISITS_TABLE)
            .columns(VISIT_COLUMNS)
            .order(Order::asc("queue_number"));

        if let Some(date) = query.date {
            select = select.eq("visit_date", date.to_string());
        }
        if let Some(statuses) = query.statuses.as_ref().filter(|s| !s.is_empty()) {
            let statuses = canonical_statuses(statuses.clone());
            select = select.filter(Filter::in_list("status", statuses.iter().map(VisitStatus::as_str)));
        }
        select
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_keys_nest_under_day_key() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let key = visits_key(&VisitQuery::on(today));
        assert_eq!(key.to_string(), "visits/2026-10-17/*");
        assert!(day_key(today).is_prefix_of(&key));

        let filtered = visits_key(&VisitQuery::on(today).with_statuses(vec![VisitStatus::InQueue, VisitStatus::VitalSigns]));
        assert_eq!(filtered.to_string(), "visits/2026-10-17/InQueue,VitalSigns");
        assert!(day_key(today).is_prefix_of(&filtered));

        assert_eq!(visits_key(&VisitQuery::default()).to_string(), "visits/*/*");
    }

    #[test]
    fn past_day_keys() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let yesterday = today.pred_opt().unwrap();

        assert!(is_past_day(&visits_key(&VisitQuery::on(yesterday)), today));
        assert!(!is_past_day(&visits_key(&VisitQuery::on(today)), today));
        assert!(!is_past_day(&visits_key(&VisitQuery::default()), today));
        assert!(!is_past_day(&CacheKey::new("patient-account").param(yesterday), today));
    }

    #[test]
    fn equivalent_status_filters_share_a_key() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let unordered = VisitQuery {
            date: Some(today),
            statuses: Some(vec![VisitStatus::VitalSigns, VisitStatus::InQueue, VisitStatus::VitalSigns]),
        };

        assert_eq!(visits_key(&unordered).to_string(), "visits/2026-10-17/InQueue,VitalSigns");
    }

    #[test]
    fn list_select_renders_filters() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let select = VisitService::list_select(&VisitQuery::on(today).with_statuses(vec![VisitStatus::InQueue]));
        assert_eq!(
            select.to_query_string(),
            "select=*,patients(id,hn,first_name,last_name,dob,allergies)&visit_date=eq.2026-10-17&status=in.(InQueue)&order=queue_number.asc"
        );
    }
}
