//! Daily chip-faucet accrual.
//!
//! Missed days accumulate: a user absent for five days collects 50 chips on
//! return. Running the accrual twice on one day is a no-op.

use chrono::NaiveDate;

/// Chips granted once at account creation, as a `signup_bonus` ledger entry.
pub const STARTING_CHIPS: i64 = 100;

/// Chips credited per elapsed day by the faucet.
pub const DAILY_CHIPS: i64 = 10;

/// Whole days elapsed since the last credit and the chips owed for them.
/// Never negative; a watermark in the future owes nothing.
pub fn chips_owed(last_credit: NaiveDate, as_of: NaiveDate) -> (i64, i64) {
    let missed_days = (as_of - last_credit).num_days().max(0);
    (missed_days, missed_days * DAILY_CHIPS)
}
