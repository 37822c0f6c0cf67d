pub mod account;
pub mod patient;

pub use account::AccountService;
pub use patient::PatientService;
