//! Cluster membership and maintenance-mode coordination.
//!
//! Every process publishes heartbeats for its own `ServiceInstance` and
//! derives a TTL-expiring membership view from the heartbeats it
//! consumes. Maintenance enter/exit events broadcast over the cluster
//! event queue drain or resume message delivery process-wide.

pub mod maintenance;
pub mod registry;

pub use maintenance::MaintenanceCoordinator;
pub use registry::{MembershipView, ServiceRegistry};
