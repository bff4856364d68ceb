//! Referral bonus rules and access-expiry arithmetic

use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::models::Doctor;

/// Months credited to a referrer per successful referral
pub const REFERRAL_BONUS_MONTHS: i32 = 1;

/// Referrer to reward, if the referred tenant qualifies right now.
///
/// Qualifies when it names a real referrer (not itself), the latch is still
/// open and the eligibility time has passed. No eligibility time means not
/// eligible.
pub fn referral_target(referred: &Doctor, now: OffsetDateTime) -> Option<Uuid> {
    if referred.referral_bonus_applied {
        return None;
    }
    let referrer = referred.referred_by_doctor_id.filter(|id| *id != referred.id)?;
    match referred.referral_eligible_at {
        Some(eligible_at) if now >= eligible_at => Some(referrer),
        _ => None,
    }
}

/// Add calendar months, clamping the day to the end of the target month
pub fn add_months(at: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = at.date();
    let total = date.year() * 12 + (date.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;
    let month = Month::try_from(month_index).unwrap_or(Month::January);
    let day = date.day().min(time::util::days_in_year_month(year, month));

    match Date::from_calendar_date(year, month, day) {
        Ok(target) => at.replace_date(target),
        Err(_) => at,
    }
}

/// New access expiry after granting `months`: extends from the current
/// expiry when it is still in the future, otherwise from now
pub fn extend_access(
    current: Option<OffsetDateTime>,
    months: i32,
    now: OffsetDateTime,
) -> OffsetDateTime {
    let base = match current {
        Some(expires) if expires > now => expires,
        _ => now,
    };
    add_months(base, months)
}
