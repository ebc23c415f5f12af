use crate::types::RentalSession;

/// Cost per started hour within a day, in HK$
pub const HOURLY_RATE: f64 = 5.0;

/// Maximum charge for any single 24-hour window, in HK$
pub const DAILY_CAP: f64 = 25.0;

/// Refundable deposit required before renting, in HK$; also the absolute
/// ceiling on any settled cost
pub const DEPOSIT_AMOUNT: f64 = 100.0;

/// Rentals held strictly longer than this forfeit the full deposit
pub const FORFEIT_AFTER_HOURS: f64 = 72.0;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Elapsed rental time in fractional hours
#[must_use]
pub fn duration_hours(start_ms: i64, end_ms: i64) -> f64 {
    ((end_ms - start_ms).max(0) as f64) / MS_PER_HOUR
}

/// Compute the cost of a rental, in HK$.
///
/// Rules, in order:
///
/// 1. A free first rental costs nothing regardless of duration.
/// 2. Strictly more than 72 hours forfeits the full deposit (HK$100); the
///    per-hour tiers are not applied. Exactly 72 hours is still tiered.
/// 3. Otherwise each full day costs the daily cap, and the remainder is
///    charged per started hour, itself capped at one daily cap.
/// 4. The result never exceeds HK$100.
///
/// The same function backs both the client-side live estimate and the
/// server-side settlement, so the number the user watches tick is the
/// number they are billed.
#[must_use]
pub fn rental_cost(start_ms: i64, end_ms: i64, is_free: bool) -> f64 {
    if is_free {
        return 0.0;
    }

    let hours = duration_hours(start_ms, end_ms);
    let calculated = if hours > FORFEIT_AFTER_HOURS {
        DEPOSIT_AMOUNT
    } else {
        let full_days = (hours / 24.0).floor();
        let remaining_hours = hours % 24.0;
        full_days * DAILY_CAP + (remaining_hours.ceil() * HOURLY_RATE).min(DAILY_CAP)
    };

    calculated.min(DEPOSIT_AMOUNT)
}

/// Live cost estimate for an in-progress rental
#[must_use]
pub fn live_estimate(session: &RentalSession, now_ms: i64) -> f64 {
    rental_cost(session.start_time, now_ms, session.is_free)
}
