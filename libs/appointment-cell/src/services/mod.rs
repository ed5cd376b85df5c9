pub mod coordinator;
pub mod directory;
pub mod lifecycle;
pub mod overlay;
pub mod reconciliation;
pub mod workflow;

pub use coordinator::{BookingCoordinator, StatusWatch};
pub use directory::{AppointmentDirectory, TherapistDirectory};
pub use lifecycle::{RequestLifecycleService, Resolution};
pub use overlay::PendingOverlay;
pub use reconciliation::{derive_status_map, ReconciliationEngine};
pub use workflow::AppointmentRequestWorkflow;
