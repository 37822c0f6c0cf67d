use std::sync::{Arc, RwLock};

use chrono::{FixedOffset, Local, NaiveDate, Utc};
use tracing::warn;

use shared_config::AppConfig;

#[derive(Debug, Clone)]
enum Clock {
    Local,
    Offset(FixedOffset),
    Manual(Arc<RwLock<NaiveDate>>),
}

/// Answers "what day is it at the clinic". Queue numbers and the cached day
/// view are keyed by this date, not by the UTC date.
#[derive(Debug, Clone)]
pub struct ClinicCalendar {
    clock: Clock,
}

impl ClinicCalendar {
    pub fn local() -> Self {
        Self { clock: Clock::Local }
    }

    pub fn with_offset(offset: FixedOffset) -> Self {
        Self { clock: Clock::Offset(offset) }
    }

    /// A calendar that only moves when `set_today` is called.
    pub fn manual(date: NaiveDate) -> Self {
        Self { clock: Clock::Manual(Arc::new(RwLock::new(date))) }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        match config.clinic_utc_offset_minutes {
            None => Self::local(),
            Some(minutes) => match FixedOffset::east_opt(minutes * 60) {
                Some(offset) => Self::with_offset(offset),
                None => {
                    warn!("Clinic UTC offset of {} minutes is out of range, using local time", minutes);
                    Self::local()
                }
            },
        }
    }

    pub fn today(&self) -> NaiveDate {
        match &self.clock {
            Clock::Local => Local::now().date_naive(),
            Clock::Offset(offset) => Utc::now().with_timezone(offset).date_naive(),
            Clock::Manual(date) => *date.read().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Moves a manual calendar to `date`. No effect on wall-clock calendars.
    pub fn set_today(&self, date: NaiveDate) {
        if let Clock::Manual(current) = &self.clock {
            *current.write().unwrap_or_else(|e| e.into_inner()) = date;
        }
    }
}
