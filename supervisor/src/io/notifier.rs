//! Best-effort status pushes to tenants.

use tracing::info;

use crate::core::types::TenantId;

/// Fire-and-forget delivery. Implementations must not block for long and
/// swallow their own delivery failures.
pub trait Notifier: Send + Sync {
    fn send(&self, tenant: TenantId, text: &str);
}

/// Notifier that writes messages to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, tenant: TenantId, text: &str) {
        info!(tenant = %tenant, message = %text, "notify");
    }
}
