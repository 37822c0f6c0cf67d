pub mod calendar;
pub mod sync;
pub mod transition;
pub mod visit;

pub use calendar::ClinicCalendar;
pub use sync::{QueueSubscription, QueueSyncService};
pub use visit::VisitService;
