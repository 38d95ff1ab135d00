use time::{Date, Duration, Month, OffsetDateTime, Time};

use crate::gateway::store_types::{CycleType, PlanRecord};

/// `[start, end)` of the billing cycle containing `at`, in UTC Unix seconds.
///
/// Daily cycles start at midnight. Monthly cycles start on the 1st; custom and unknown
/// cycle types also use the calendar month.
pub fn cycle_window(cycle_type: CycleType, at: i64) -> (i64, i64) {
    let now = OffsetDateTime::from_unix_timestamp(at).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let today = now.date();
    match cycle_type {
        CycleType::Daily => {
            let start = today.with_time(Time::MIDNIGHT).assume_utc();
            let end = start + Duration::DAY;
            (start.unix_timestamp(), end.unix_timestamp())
        }
        CycleType::Monthly | CycleType::Custom => {
            let first = first_of_month(today.year(), today.month()).unwrap_or(today);
            let (next_year, next_month) = match today.month() {
                Month::December => (today.year() + 1, Month::January),
                month => (today.year(), month.next()),
            };
            let next = first_of_month(next_year, next_month).unwrap_or(first + Duration::days(31));
            (
                first.with_time(Time::MIDNIGHT).assume_utc().unix_timestamp(),
                next.with_time(Time::MIDNIGHT).assume_utc().unix_timestamp(),
            )
        }
    }
}

fn first_of_month(year: i32, month: Month) -> Option<Date> {
    Date::from_calendar_date(year, month, 1).ok()
}

/// Remaining plan allowance, never negative.
pub fn allowance(plan: &PlanRecord, rollover: i64, consumed: i64) -> i64 {
    plan.quota_amount
        .saturating_add(rollover.max(0))
        .saturating_sub(consumed)
        .max(0)
}

/// Rollover granted to the next cycle: `leftover × carry_limit_percent / 100`.
pub fn carry_over_amount(plan: &PlanRecord, rollover: i64, consumed: i64) -> i64 {
    if !plan.allow_carry_over {
        return 0;
    }
    let leftover = allowance(plan, rollover, consumed);
    let percent = plan.carry_limit_percent.clamp(0, 100);
    leftover.saturating_mul(percent) / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::store_types::QuotaMetric;

    // 2024-02-15T13:45:00Z
    const MID_FEB: i64 = 1_708_004_700;

    fn plan(quota: i64, carry: bool, percent: i64) -> PlanRecord {
        PlanRecord {
            id: 1,
            code: "p".to_string(),
            name: "p".to_string(),
            cycle_type: CycleType::Monthly,
            cycle_duration_days: 0,
            quota_metric: QuotaMetric::Requests,
            quota_amount: quota,
            allow_carry_over: carry,
            carry_limit_percent: percent,
            allowed_models: Vec::new(),
            is_active: true,
        }
    }

    #[test]
    fn daily_window_starts_at_utc_midnight() {
        let (start, end) = cycle_window(CycleType::Daily, MID_FEB);
        assert_eq!(start, 1_707_955_200);
        assert_eq!(end - start, 86_400);
    }

    #[test]
    fn monthly_window_covers_calendar_month() {
        let (start, end) = cycle_window(CycleType::Monthly, MID_FEB);
        assert_eq!(start, 1_706_745_600); // 2024-02-01
        assert_eq!(end, 1_709_251_200); // 2024-03-01
        assert_eq!(cycle_window(CycleType::Custom, MID_FEB), (start, end));
    }

    #[test]
    fn december_rolls_into_next_year() {
        // 2023-12-31T23:59:59Z
        let (start, end) = cycle_window(CycleType::Monthly, 1_704_067_199);
        assert_eq!(start, 1_701_388_800); // 2023-12-01
        assert_eq!(end, 1_704_067_200); // 2024-01-01
    }

    #[test]
    fn carry_over_uses_leftover_and_percent() {
        assert_eq!(carry_over_amount(&plan(100, true, 50), 20, 40), 40);
        assert_eq!(carry_over_amount(&plan(100, true, 50), 0, 150), 0);
        assert_eq!(carry_over_amount(&plan(100, false, 50), 0, 0), 0);
        assert_eq!(allowance(&plan(10, false, 0), 5, 12), 3);
    }
}
