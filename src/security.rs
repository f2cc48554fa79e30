// ============================================================================
// Security
// ============================================================================

use crate::core::{ContainerError, Result};
use crate::dispatch::InvocationContext;

/// Access-control seam consulted immediately before business dispatch.
/// A denial surfaces as a system-level `AccessDenied`.
pub trait SecurityGuard: Send + Sync {
    fn check(&self, ctx: &InvocationContext) -> Result<()>;
}

/// Default guard: every caller may invoke every method.
pub struct AllowAll;

impl SecurityGuard for AllowAll {
    fn check(&self, _ctx: &InvocationContext) -> Result<()> {
        Ok(())
    }
}

/// Guard that requires a caller principal to be present on the invocation.
pub struct RequirePrincipal;

impl SecurityGuard for RequirePrincipal {
    fn check(&self, ctx: &InvocationContext) -> Result<()> {
        match ctx.request.caller {
            Some(_) => Ok(()),
            None => Err(ContainerError::AccessDenied(format!(
                "No caller principal for {}.{}",
                ctx.request.component, ctx.request.method
            ))),
        }
    }
}
