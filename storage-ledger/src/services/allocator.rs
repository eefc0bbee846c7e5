//! Oldest-first allocation of a lump payment across outstanding records.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Amount still owed on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingDue {
    pub record_id: Uuid,
    pub total_due: Decimal,
}

/// Share of a payment applied to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub record_id: Uuid,
    pub amount_applied: Decimal,
    pub remaining_due: Decimal,
}

/// Outcome of a FIFO allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoAllocation {
    pub allocations: Vec<Allocation>,
    pub unallocated: Decimal,
}

impl FifoAllocation {
    pub fn total_applied(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount_applied).sum()
    }
}

/// Spread `amount` over `dues` in the order given.
///
/// The caller sorts `dues` oldest-first. Each record takes as much as it owes
/// until the money runs out; later records get nothing. Negative dues count as
/// nothing owed. Whatever is left after the last record is `unallocated`.
pub fn allocate_fifo(dues: &[OutstandingDue], amount: Decimal) -> FifoAllocation {
    let mut remaining = amount.max(Decimal::ZERO);

    let allocations = dues
        .iter()
        .map(|due| {
            let owed = due.total_due.max(Decimal::ZERO);
            let applied = remaining.min(owed);
            remaining -= applied;
            Allocation {
                record_id: due.record_id,
                amount_applied: applied,
                remaining_due: due.total_due - applied,
            }
        })
        .collect();

    FifoAllocation {
        allocations,
        unallocated: remaining,
    }
}
