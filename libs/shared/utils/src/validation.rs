use chrono::NaiveDate;
use regex::Regex;

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";
const NATIONAL_ID_PATTERN: &str = r"^\d{13}$";
const PHONE_PATTERN: &str = r"^\d{9,10}$";

pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Shape checks run before anything is sent to the backend.
#[derive(Debug, Clone)]
pub struct InputValidator {
    email: Option<Regex>,
    national_id: Option<Regex>,
    phone: Option<Regex>,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator {
    pub fn new() -> Self {
        Self {
            email: Regex::new(EMAIL_PATTERN).ok(),
            national_id: Regex::new(NATIONAL_ID_PATTERN).ok(),
            phone: Regex::new(PHONE_PATTERN).ok(),
        }
    }

    pub fn is_email(&self, email: &str) -> bool {
        email.len() <= 254 && is_match(&self.email, email)
    }

    /// Thai national ID: 13 digits, no separators.
    pub fn is_national_id(&self, national_id: &str) -> bool {
        is_match(&self.national_id, national_id)
    }

    /// Local phone number of 9 or 10 digits, separators stripped.
    pub fn is_phone(&self, phone: &str) -> bool {
        is_match(&self.phone, &digits_only(phone))
    }

    pub fn parse_date(&self, date: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()
    }
}

pub fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn is_match(regex: &Option<Regex>, value: &str) -> bool {
    regex.as_ref().is_some_and(|re| re.is_match(value))
}
