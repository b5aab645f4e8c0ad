//! Tenant entitlement: subscription state and plan-derived permissions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::core::types::TenantId;
use crate::io::config::{FREE_PLAN, PlanConfig, SupervisorConfig, TenantConfig};

pub trait Entitlement: Send + Sync {
    fn is_active(&self, tenant: TenantId) -> bool;
    fn plan_allows_auto_restart(&self, tenant: TenantId) -> bool;
    /// `None` means unbounded.
    fn max_concurrent_scripts(&self, tenant: TenantId) -> Option<u32>;
}

/// Entitlement backed by the `[plans]` and `[tenants]` config tables.
///
/// Unknown tenants are inactive. Free-plan and lifetime tenants are always
/// active; everyone else is active until `subscription_end`.
#[derive(Debug, Clone)]
pub struct PlanEntitlement {
    plans: BTreeMap<String, PlanConfig>,
    tenants: BTreeMap<u64, TenantConfig>,
}

impl PlanEntitlement {
    pub fn from_config(cfg: &SupervisorConfig) -> Self {
        let tenants = cfg
            .tenants
            .iter()
            .filter_map(|(id, tenant)| id.parse::<u64>().ok().map(|id| (id, tenant.clone())))
            .collect();
        Self {
            plans: cfg.plans(),
            tenants,
        }
    }

    fn is_active_at(&self, tenant: TenantId, now: DateTime<Utc>) -> bool {
        let Some(cfg) = self.tenants.get(&tenant.0) else {
            return false;
        };
        if cfg.lifetime || cfg.plan == FREE_PLAN {
            return true;
        }
        cfg.subscription_end.is_some_and(|end| end > now)
    }

    fn plan(&self, tenant: TenantId) -> Option<&PlanConfig> {
        self.tenants
            .get(&tenant.0)
            .and_then(|cfg| self.plans.get(&cfg.plan))
    }
}

impl Entitlement for PlanEntitlement {
    fn is_active(&self, tenant: TenantId) -> bool {
        self.is_active_at(tenant, Utc::now())
    }

    fn plan_allows_auto_restart(&self, tenant: TenantId) -> bool {
        self.plan(tenant).is_some_and(|plan| plan.auto_restart)
    }

    fn max_concurrent_scripts(&self, tenant: TenantId) -> Option<u32> {
        match self.plan(tenant) {
            Some(plan) => plan.max_scripts,
            None => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entitlement(tenants: &[(u64, &str, bool, Option<DateTime<Utc>>)]) -> PlanEntitlement {
        let mut cfg = SupervisorConfig::default();
        for (id, plan, lifetime, end) in tenants {
            cfg.tenants.insert(
                id.to_string(),
                TenantConfig {
                    plan: plan.to_string(),
                    lifetime: *lifetime,
                    subscription_end: *end,
                },
            );
        }
        PlanEntitlement::from_config(&cfg)
    }

    #[test]
    fn subscription_end_controls_activity() {
        let now = Utc::now();
        let ent = entitlement(&[
            (1, "pro", false, Some(now + Duration::days(3))),
            (2, "pro", false, Some(now - Duration::days(1))),
            (3, "pro", false, None),
        ]);
        assert!(ent.is_active_at(TenantId(1), now));
        assert!(!ent.is_active_at(TenantId(2), now));
        assert!(!ent.is_active_at(TenantId(3), now));
    }

    #[test]
    fn free_and_lifetime_are_always_active() {
        let ent = entitlement(&[(1, "free", false, None), (2, "lifetime", true, None)]);
        assert!(ent.is_active(TenantId(1)));
        assert!(ent.is_active(TenantId(2)));
        assert!(!ent.is_active(TenantId(99)));
    }

    #[test]
    fn plan_permissions() {
        let ent = entitlement(&[(1, "free", false, None), (2, "lifetime", true, None), (3, "basic", false, None)]);
        assert!(!ent.plan_allows_auto_restart(TenantId(1)));
        assert!(ent.plan_allows_auto_restart(TenantId(3)));
        assert_eq!(ent.max_concurrent_scripts(TenantId(1)), Some(1));
        assert_eq!(ent.max_concurrent_scripts(TenantId(2)), None);
        assert_eq!(ent.max_concurrent_scripts(TenantId(3)), Some(5));
        assert_eq!(ent.max_concurrent_scripts(TenantId(42)), Some(0));
    }
}
