use conductor_errors::{CoordinatorError, CoordinatorResult};

/// Tenant identifier used when multi-tenancy is not enabled.
pub const MAIN_TENANT: &str = "main";

/// Boundary through which every inbound request must pass before any
/// queue operation. Kept as a trait even though the shipped resolver is a
/// constant, so multi-tenant deployments can plug their own without the
/// sentinel leaking through the queue/dispatch layers.
pub trait TenantResolver: Send + Sync {
    /// Resolves an optional client-supplied tenant id to the single
    /// canonical identifier, or rejects the request.
    fn resolve(&self, requested: Option<&str>) -> CoordinatorResult<String>;
}

/// Single-tenant resolver: everything is `"main"`, anything else is a
/// client error. Never silently coerces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTenantResolver;

impl TenantResolver for SingleTenantResolver {
    fn resolve(&self, requested: Option<&str>) -> CoordinatorResult<String> {
        match requested {
            None => Ok(MAIN_TENANT.to_string()),
            Some(MAIN_TENANT) => Ok(MAIN_TENANT.to_string()),
            Some(other) => Err(CoordinatorError::tenant_mismatch(other)),
        }
    }
}
