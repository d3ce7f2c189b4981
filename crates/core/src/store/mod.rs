//! Store and routing collaborator interfaces.

mod traits;

pub use traits::{AttemptLog, HealthRecordStore, InstitutionRoute, InstitutionRouting};
