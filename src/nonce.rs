use std::collections::BTreeSet;

use ethers_core::types::Address;

use crate::error::NonceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The nonce was the top reservation; the watermark moved back.
    RolledBack,
    /// Released out of order; reusable after the next confirmed-nonce advance.
    Gap,
    /// The chain already consumed this nonce.
    AlreadyConsumed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceStats {
    pub reserved: u64,
    pub released: u64,
    pub confirmed: u64,
    pub outstanding: Vec<u64>,
}

/// Per-account nonce watermark with LIFO release.
///
/// `watermark` is the next fresh nonce. Nonces released out of order sit in
/// `gaps` until the confirmed nonce advances, then move to `reclaimable` and are
/// handed out before fresh ones.
#[derive(Debug, Clone)]
pub struct NonceBook {
    account: Address,
    confirmed: u64,
    watermark: u64,
    outstanding: BTreeSet<u64>,
    gaps: BTreeSet<u64>,
    reclaimable: BTreeSet<u64>,
    max_in_flight: usize,
    halted: Option<String>,
    reserved_total: u64,
    released_total: u64,
    confirmed_total: u64,
}

impl NonceBook {
    pub fn new(account: Address, confirmed: u64, max_in_flight: usize) -> Self {
        Self {
            account,
            confirmed,
            watermark: confirmed,
            outstanding: BTreeSet::new(),
            gaps: BTreeSet::new(),
            reclaimable: BTreeSet::new(),
            max_in_flight: max_in_flight.max(1),
            halted: None,
            reserved_total: 0,
            released_total: 0,
            confirmed_total: 0,
        }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn resume(&mut self) {
        self.halted = None;
    }

    pub fn reserve(&mut self) -> Result<u64, NonceError> {
        if self.halted.is_some() {
            return Err(NonceError::Halted(self.account));
        }
        if self.outstanding.len() >= self.max_in_flight {
            return Err(NonceError::Busy { account: self.account, outstanding: self.outstanding.len() });
        }
        let nonce = match self.reclaimable.pop_first() {
            Some(n) => n,
            None => {
                let n = self.watermark;
                self.watermark += 1;
                n
            }
        };
        if !self.outstanding.insert(nonce) {
            return Err(self.violation(format!("nonce {nonce} reserved twice without release")));
        }
        self.reserved_total += 1;
        Ok(nonce)
    }

    pub fn release(&mut self, nonce: u64) -> Result<ReleaseOutcome, NonceError> {
        if nonce < self.confirmed && !self.outstanding.contains(&nonce) {
            return Ok(ReleaseOutcome::AlreadyConsumed);
        }
        if !self.outstanding.remove(&nonce) {
            return Err(self.violation(format!("release of nonce {nonce} that is not outstanding")));
        }
        self.released_total += 1;
        if nonce + 1 == self.watermark {
            self.watermark = nonce;
            self.collapse_top();
            Ok(ReleaseOutcome::RolledBack)
        } else {
            self.gaps.insert(nonce);
            Ok(ReleaseOutcome::Gap)
        }
    }

    /// Terminal release for a nonce the chain consumed.
    pub fn confirm(&mut self, nonce: u64) -> Result<ReleaseOutcome, NonceError> {
        if nonce < self.confirmed && !self.outstanding.contains(&nonce) {
            return Ok(ReleaseOutcome::AlreadyConsumed);
        }
        if !self.outstanding.remove(&nonce) {
            return Err(self.violation(format!("confirmation of nonce {nonce} that is not outstanding")));
        }
        self.confirmed_total += 1;
        self.advance_confirmed(nonce + 1);
        Ok(ReleaseOutcome::AlreadyConsumed)
    }

    /// Applies an observed on-chain nonce. Gaps are reclaimed only when the
    /// confirmed nonce actually moves forward; repeats and backwards moves
    /// are ignored.
    pub fn advance_confirmed(&mut self, confirmed: u64) {
        if confirmed <= self.confirmed {
            return;
        }
        self.confirmed = confirmed;
        self.outstanding.retain(|n| *n >= confirmed);
        self.reclaimable.retain(|n| *n >= confirmed);
        let gaps = std::mem::take(&mut self.gaps);
        self.reclaimable.extend(gaps.into_iter().filter(|n| *n >= confirmed));
        self.watermark = self.watermark.max(confirmed);
        self.collapse_top();
    }

    pub fn stats(&self) -> NonceStats {
        NonceStats {
            reserved: self.reserved_total,
            released: self.released_total,
            confirmed: self.confirmed_total,
            outstanding: self.outstanding.iter().copied().collect(),
        }
    }

    fn collapse_top(&mut self) {
        while self.watermark > self.confirmed {
            let top = self.watermark - 1;
            if self.outstanding.contains(&top) {
                break;
            }
            if self.gaps.remove(&top) || self.reclaimable.remove(&top) {
                self.watermark = top;
            } else {
                break;
            }
        }
    }

    fn violation(&mut self, detail: String) -> NonceError {
        self.halted = Some(detail.clone());
        NonceError::InvariantViolation { account: self.account, detail }
    }
}
