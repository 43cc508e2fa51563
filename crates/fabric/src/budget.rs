//! Shared connection budgets.
//!
//! A connection that multiplexes streams (HTTP/2) owns one budget, credits it
//! as the peer opens its connection window, and hands the budget id to every
//! stream in its `Window` frames. Senders on those streams claim from the
//! same budget through a [`BudgetDebitor`] before writing, so the connection
//! window is split between streams without double counting.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::trace;
use triomphe::Arc;

pub type CreditorIndex = u64;

#[derive(Default)]
struct Budgets {
    next_budget_id: u64,
    budgets: HashMap<u64, i64>,
}

/// Owner side of shared budgets.
#[derive(Clone, Default)]
pub struct BudgetCreditor {
    inner: Arc<Mutex<Budgets>>,
}

impl BudgetCreditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supply_budget_id(&self) -> u64 {
        let mut budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        budgets.next_budget_id += 1;
        budgets.next_budget_id
    }

    /// Starts tracking `budget_id` with zero credit.
    pub fn acquire(&self, budget_id: u64) -> CreditorIndex {
        let mut budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        budgets.budgets.entry(budget_id).or_insert(0);
        budget_id
    }

    /// Adds credit, returning the budget before the credit was applied.
    pub fn credit(&self, trace_id: u64, index: CreditorIndex, credit: i64) -> i64 {
        let mut budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let budget = budgets.budgets.entry(index).or_insert(0);
        let previous = *budget;
        *budget += credit;
        trace!(trace_id, budget_id = index, previous, credit, "credit budget");
        previous
    }

    pub fn available(&self, index: CreditorIndex) -> i64 {
        let budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        budgets.budgets.get(&index).copied().unwrap_or(0)
    }

    pub fn release(&self, index: CreditorIndex) {
        let mut budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        budgets.budgets.remove(&index);
    }

    pub fn debitor(&self) -> BudgetDebitor {
        BudgetDebitor { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for BudgetCreditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("BudgetCreditor").field("budgets", &budgets.budgets.len()).finish()
    }
}

/// Claiming side of shared budgets.
#[derive(Clone)]
pub struct BudgetDebitor {
    inner: Arc<Mutex<Budgets>>,
}

impl BudgetDebitor {
    /// Claims between `minimum` and `maximum` from the budget.
    ///
    /// Returns zero when less than `minimum` is available, nothing is
    /// claimed in that case.
    pub fn claim(&self, budget_id: u64, minimum: i64, maximum: i64) -> i64 {
        let mut budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(budget) = budgets.budgets.get_mut(&budget_id) else {
            return 0;
        };

        let claimed = maximum.min(*budget);
        if claimed < minimum || claimed <= 0 {
            return 0;
        }

        *budget -= claimed;
        claimed
    }

    pub fn available(&self, budget_id: u64) -> i64 {
        let budgets = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        budgets.budgets.get(&budget_id).copied().unwrap_or(0)
    }
}

impl fmt::Debug for BudgetDebitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetDebitor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_then_claim() {
        let creditor = BudgetCreditor::new();
        let budget_id = creditor.supply_budget_id();
        let index = creditor.acquire(budget_id);

        assert_eq!(creditor.credit(0, index, 100), 0);
        assert_eq!(creditor.credit(0, index, 50), 100);

        let debitor = creditor.debitor();
        assert_eq!(debitor.claim(budget_id, 10, 120), 120);
        assert_eq!(debitor.available(budget_id), 30);
    }

    #[test]
    fn test_claim_below_minimum() {
        let creditor = BudgetCreditor::new();
        let index = creditor.acquire(9);
        creditor.credit(0, index, 20);

        let debitor = creditor.debitor();
        assert_eq!(debitor.claim(9, 30, 40), 0);
        assert_eq!(creditor.available(index), 20);
    }

    #[test]
    fn test_released_budget_cannot_be_claimed() {
        let creditor = BudgetCreditor::new();
        let index = creditor.acquire(3);
        creditor.credit(0, index, 20);
        creditor.release(index);

        assert_eq!(creditor.debitor().claim(3, 1, 10), 0);
    }
}
