use crate::{
    billing::DEPOSIT_AMOUNT,
    types::{Stall, UserProfile},
};
use std::fmt;

/// Why a rental may not start
///
/// Every UI entry point that can trigger a rent action runs the same
/// predicate, so the user sees one consistent reason regardless of whether
/// they arrived from the stall page or the map scan flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    /// The stall has no umbrellas to dispense
    NoUmbrellas,
    /// The refundable deposit has not been paid in full
    DepositRequired,
    /// No spendable balance and the free first rental is already used
    InsufficientBalance,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUmbrellas => {
                write!(f, "No umbrellas are available at this stall.")
            }
            Self::DepositRequired => {
                write!(f, "A HK$100 refundable deposit is required to rent.")
            }
            Self::InsufficientBalance => {
                write!(f, "Your spendable balance is HK$0. Please add funds.")
            }
        }
    }
}

/// Decide whether `user` may start a rental at `stall`.
///
/// A rental may start only if the stall has stock, the user's deposit is at
/// least HK$100, and either this is the user's free first rental or their
/// balance is positive. Checks run in that order so the surfaced reason is
/// stable.
///
/// # Errors
///
/// Returns the first [`IneligibleReason`] that applies.
pub fn check_rental_eligibility(stall: &Stall, user: &UserProfile) -> Result<(), IneligibleReason> {
    if !stall.has_stock() {
        return Err(IneligibleReason::NoUmbrellas);
    }
    if user.deposit < DEPOSIT_AMOUNT {
        return Err(IneligibleReason::DepositRequired);
    }
    if !user.is_first_rental() && user.balance <= 0.0 {
        return Err(IneligibleReason::InsufficientBalance);
    }
    Ok(())
}
