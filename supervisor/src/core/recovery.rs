//! Recovery eligibility for a crashed script.

use crate::core::attempt::Attempt;

/// Inputs gathered by the monitor for one dead record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInputs {
    pub entitlement_active: bool,
    pub plan_auto_restart: bool,
    pub attempt: Attempt,
}

/// What the monitor does with a dead record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Remove the record and relaunch at the given attempt.
    Relaunch(Attempt),
    /// Remove the record; the script ends Stopped.
    Release(ReleaseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    EntitlementInactive,
    AutoRestartDisabled,
    AttemptsExhausted,
}

impl ReleaseReason {
    pub fn describe(self) -> &'static str {
        match self {
            ReleaseReason::EntitlementInactive => "subscription inactive",
            ReleaseReason::AutoRestartDisabled => "plan does not include auto-restart",
            ReleaseReason::AttemptsExhausted => "restart attempts exhausted",
        }
    }
}

/// Relaunch only when every condition holds; the first failing one is reported.
pub fn decide(inputs: RecoveryInputs) -> RecoveryDecision {
    if !inputs.entitlement_active {
        return RecoveryDecision::Release(ReleaseReason::EntitlementInactive);
    }
    if !inputs.plan_auto_restart {
        return RecoveryDecision::Release(ReleaseReason::AutoRestartDisabled);
    }
    match inputs.attempt.next() {
        Some(next) => RecoveryDecision::Relaunch(next),
        None => RecoveryDecision::Release(ReleaseReason::AttemptsExhausted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(active: bool, auto: bool, attempt: u8) -> RecoveryInputs {
        RecoveryInputs {
            entitlement_active: active,
            plan_auto_restart: auto,
            attempt: Attempt::new(attempt).expect("attempt"),
        }
    }

    #[test]
    fn relaunches_only_when_all_conditions_hold() {
        for active in [false, true] {
            for auto in [false, true] {
                for attempt in 1..=3u8 {
                    let decision = decide(inputs(active, auto, attempt));
                    let eligible = active && auto && attempt < 3;
                    assert_eq!(
                        matches!(decision, RecoveryDecision::Relaunch(_)),
                        eligible,
                        "active={active} auto={auto} attempt={attempt}"
                    );
                }
            }
        }
    }

    #[test]
    fn relaunch_continues_the_chain() {
        assert_eq!(
            decide(inputs(true, true, 2)),
            RecoveryDecision::Relaunch(Attempt::new(3).expect("attempt"))
        );
    }

    #[test]
    fn auto_restart_disabled_is_reported() {
        assert_eq!(
            decide(inputs(true, false, 1)),
            RecoveryDecision::Release(ReleaseReason::AutoRestartDisabled)
        );
    }

    #[test]
    fn last_attempt_is_released() {
        assert_eq!(
            decide(inputs(true, true, 3)),
            RecoveryDecision::Release(ReleaseReason::AttemptsExhausted)
        );
    }
}
