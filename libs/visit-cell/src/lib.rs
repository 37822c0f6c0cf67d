pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::VisitError;
pub use models::*;
pub use router::create_visit_router;
pub use services::*;
