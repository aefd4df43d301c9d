use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ethers_core::types::Address;
use parking_lot::Mutex;

use crate::config::RiskConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    KillSwitch,
    GasCeiling { spent: u128, proposed: u128, ceiling: u128 },
    LossCeiling { loss: u128, ceiling: u128 },
    OpenPositions { account: Address, open: usize, limit: usize },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::KillSwitch => write!(f, "kill switch engaged"),
            DenyReason::GasCeiling { spent, proposed, ceiling } => {
                write!(f, "gas spend {spent} + {proposed} exceeds ceiling {ceiling}")
            }
            DenyReason::LossCeiling { loss, ceiling } => write!(f, "cumulative loss {loss} reached ceiling {ceiling}"),
            DenyReason::OpenPositions { account, open, limit } => {
                write!(f, "{account:?} has {open} open positions (limit {limit})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Allow,
    Deny(DenyReason),
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskSnapshot {
    pub window_spend: u128,
    pub cumulative_loss: u128,
    pub loss_streak: u32,
    pub open_positions: usize,
    pub kill_switch: bool,
}

#[derive(Debug, Default)]
struct Counters {
    spends: VecDeque<(Instant, u128)>,
    window_spend: u128,
    cumulative_loss: u128,
    loss_streak: u32,
    open: HashMap<Address, usize>,
}

impl Counters {
    fn roll_window(&mut self, now: Instant, window: Duration) {
        while let Some((at, amount)) = self.spends.front().copied() {
            if now.duration_since(at) < window {
                break;
            }
            self.spends.pop_front();
            self.window_spend = self.window_spend.saturating_sub(amount);
        }
    }
}

/// Spend, loss and position limits consulted before building and before sending.
///
/// All counters sit behind one mutex; the kill switch is an atomic so it can
/// be flipped without waiting on the counters.
pub struct RiskGuard {
    limits: RiskConfig,
    counters: Mutex<Counters>,
    kill_switch: AtomicBool,
}

impl RiskGuard {
    pub fn new(limits: RiskConfig) -> Self {
        Self { limits, counters: Mutex::new(Counters::default()), kill_switch: AtomicBool::new(false) }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.limits.spend_window_secs)
    }

    pub fn check(&self, proposed_spend: u128, account: Address) -> RiskDecision {
        let decision = self.evaluate(&mut self.counters.lock(), proposed_spend, account);
        log_denial(&decision, proposed_spend, account);
        decision
    }

    /// Checks and, when allowed, records the spend and opens a position for
    /// `account` under the same lock, so concurrent sends cannot overshoot a limit.
    pub fn try_commit(&self, proposed_spend: u128, account: Address) -> RiskDecision {
        let decision = {
            let mut c = self.counters.lock();
            let decision = self.evaluate(&mut c, proposed_spend, account);
            if decision.is_allowed() {
                c.spends.push_back((Instant::now(), proposed_spend));
                c.window_spend = c.window_spend.saturating_add(proposed_spend);
                *c.open.entry(account).or_default() += 1;
            }
            decision
        };
        log_denial(&decision, proposed_spend, account);
        decision
    }

    fn evaluate(&self, c: &mut Counters, proposed_spend: u128, account: Address) -> RiskDecision {
        if self.kill_switch.load(Ordering::Acquire) {
            return RiskDecision::Deny(DenyReason::KillSwitch);
        }
        c.roll_window(Instant::now(), self.window());
        let ceiling = self.limits.gas_spend_ceiling_wei;
        if c.window_spend.saturating_add(proposed_spend) > ceiling {
            return RiskDecision::Deny(DenyReason::GasCeiling {
                spent: c.window_spend,
                proposed: proposed_spend,
                ceiling,
            });
        }
        if c.cumulative_loss >= self.limits.max_cumulative_loss_wei {
            return RiskDecision::Deny(DenyReason::LossCeiling {
                loss: c.cumulative_loss,
                ceiling: self.limits.max_cumulative_loss_wei,
            });
        }
        let open = c.open.get(&account).copied().unwrap_or(0);
        if open >= self.limits.max_open_positions {
            let limit = self.limits.max_open_positions;
            return RiskDecision::Deny(DenyReason::OpenPositions { account, open, limit });
        }
        RiskDecision::Allow
    }

    /// Commits gas exposure for a sent bundle to the rolling window.
    pub fn record_spend(&self, amount: u128) {
        let mut c = self.counters.lock();
        c.roll_window(Instant::now(), self.window());
        c.spends.push_back((Instant::now(), amount));
        c.window_spend = c.window_spend.saturating_add(amount);
    }

    pub fn open_position(&self, account: Address) {
        *self.counters.lock().open.entry(account).or_default() += 1;
    }

    pub fn close_position(&self, account: Address) {
        let mut c = self.counters.lock();
        if let Some(open) = c.open.get_mut(&account) {
            *open = open.saturating_sub(1);
            if *open == 0 {
                c.open.remove(&account);
            }
        }
    }

    /// Folds a realized outcome into loss accounting. Trips the kill switch after
    /// the configured number of consecutive losses.
    pub fn record_outcome(&self, realized: i128) {
        let streak = {
            let mut c = self.counters.lock();
            if realized < 0 {
                c.cumulative_loss = c.cumulative_loss.saturating_add(realized.unsigned_abs());
                c.loss_streak += 1;
            } else {
                c.loss_streak = 0;
            }
            c.loss_streak
        };
        if self.limits.loss_streak_kill > 0 && streak >= self.limits.loss_streak_kill {
            self.engage_kill_switch("consecutive loss streak");
        }
    }

    pub fn engage_kill_switch(&self, reason: &str) {
        if !self.kill_switch.swap(true, Ordering::AcqRel) {
            tracing::warn!(reason, "kill switch engaged");
        }
    }

    pub fn reset_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::Release);
        self.counters.lock().loss_streak = 0;
        tracing::info!("kill switch reset");
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let mut c = self.counters.lock();
        c.roll_window(Instant::now(), self.window());
        RiskSnapshot {
            window_spend: c.window_spend,
            cumulative_loss: c.cumulative_loss,
            loss_streak: c.loss_streak,
            open_positions: c.open.values().sum(),
            kill_switch: self.kill_switch_engaged(),
        }
    }
}

fn log_denial(decision: &RiskDecision, proposed_spend: u128, account: Address) {
    if let RiskDecision::Deny(reason) = decision {
        tracing::info!(
            outcome = "deny",
            account = ?account,
            proposed_spend = %proposed_spend,
            %reason,
            "risk guard denied"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    fn limits() -> RiskConfig {
        RiskConfig {
            gas_spend_ceiling_wei: 100,
            spend_window_secs: 3_600,
            max_cumulative_loss_wei: 1_000,
            max_open_positions: 2,
            loss_streak_kill: 3,
        }
    }

    #[test]
    fn gas_ceiling_allows_up_to_limit() {
        let guard = RiskGuard::new(limits());
        let acct = Address::repeat_byte(1);
        guard.record_spend(95);
        assert_eq!(
            guard.check(10, acct),
            RiskDecision::Deny(DenyReason::GasCeiling { spent: 95, proposed: 10, ceiling: 100 })
        );
        assert_eq!(guard.check(4, acct), RiskDecision::Allow);
    }

    #[test]
    fn spend_rolls_out_of_window() {
        let mut l = limits();
        l.spend_window_secs = 0;
        let guard = RiskGuard::new(l);
        guard.record_spend(100);
        assert!(guard.check(50, Address::zero()).is_allowed());
    }

    #[test]
    fn loss_streak_trips_kill_switch() {
        let guard = RiskGuard::new(limits());
        guard.record_outcome(-1);
        guard.record_outcome(-1);
        assert!(!guard.kill_switch_engaged());
        guard.record_outcome(-1);
        assert!(guard.kill_switch_engaged());
        assert_eq!(guard.check(0, Address::zero()), RiskDecision::Deny(DenyReason::KillSwitch));
        guard.reset_kill_switch();
        assert!(guard.check(0, Address::zero()).is_allowed());
    }

    #[test]
    fn profit_resets_streak() {
        let guard = RiskGuard::new(limits());
        guard.record_outcome(-1);
        guard.record_outcome(-1);
        guard.record_outcome(5);
        guard.record_outcome(-1);
        assert!(!guard.kill_switch_engaged());
        assert_eq!(guard.snapshot().cumulative_loss, 3);
    }

    #[test]
    fn open_positions_are_per_account() {
        let guard = RiskGuard::new(limits());
        let a = Address::repeat_byte(1);
        guard.open_position(a);
        guard.open_position(a);
        assert!(matches!(guard.check(0, a), RiskDecision::Deny(DenyReason::OpenPositions { open: 2, .. })));
        assert!(guard.check(0, Address::repeat_byte(2)).is_allowed());
        guard.close_position(a);
        assert!(guard.check(0, a).is_allowed());
    }

    #[test]
    fn try_commit_records_spend_and_position() {
        let guard = RiskGuard::new(limits());
        let a = Address::repeat_byte(1);
        assert!(guard.try_commit(60, a).is_allowed());
        assert!(matches!(guard.try_commit(60, a), RiskDecision::Deny(DenyReason::GasCeiling { spent: 60, .. })));
        let snap = guard.snapshot();
        assert_eq!((snap.window_spend, snap.open_positions), (60, 1));
    }

    #[test]
    fn concurrent_commits_never_overshoot_limits() {
        for _ in 0..200 {
            let guard = Arc::new(RiskGuard::new(RiskConfig { max_open_positions: 3, ..limits() }));
            guard.record_spend(88);
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let guard = Arc::clone(&guard);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        guard.try_commit(4, Address::repeat_byte(1)).is_allowed()
                    })
                })
                .collect();
            let allowed = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
            let snap = guard.snapshot();
            assert_eq!(allowed, 3);
            assert!(snap.window_spend <= 100, "{snap:?}");
            assert_eq!(snap.open_positions, 3);
        }
    }

    #[test]
    fn cumulative_loss_ceiling_denies() {
        let guard = RiskGuard::new(RiskConfig { loss_streak_kill: 0, ..limits() });
        guard.record_outcome(-1_000);
        assert!(matches!(guard.check(0, Address::zero()), RiskDecision::Deny(DenyReason::LossCeiling { .. })));
    }
}
