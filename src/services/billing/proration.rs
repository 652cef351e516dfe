use chrono::NaiveDate;

/// How much of a billing period a rental contract actually covered.
///
/// Day arithmetic is whole calendar days with inclusive endpoints: a contract
/// running exactly the full period yields a factor of 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proration {
    pub effective_start: NaiveDate,
    pub effective_end: NaiveDate,
    pub total_days: i64,
    pub rental_days: i64,
    pub factor: f64,
}

/// True when the contract window touches the billing period at all. The
/// batch generator filters on this before proration, so `prorate` never sees
/// a disjoint window.
pub fn contract_overlaps_period(
    contract_start: NaiveDate,
    contract_end: Option<NaiveDate>,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> bool {
    contract_start <= period_end && contract_end.map_or(true, |end| end >= period_start)
}

pub fn prorate(
    period_start: NaiveDate,
    period_end: NaiveDate,
    contract_start: NaiveDate,
    contract_end: Option<NaiveDate>,
) -> Proration {
    let effective_start = contract_start.max(period_start);
    let effective_end = contract_end.map_or(period_end, |end| end.min(period_end));

    let total_days = (period_end - period_start).num_days() + 1;
    let rental_days = (effective_end - effective_start).num_days() + 1;

    let factor = if total_days <= 0 {
        1.0
    } else {
        (rental_days as f64 / total_days as f64).clamp(0.0, 1.0)
    };

    Proration {
        effective_start,
        effective_end,
        total_days,
        rental_days,
        factor,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{contract_overlaps_period, prorate};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn full_containment_yields_factor_one() {
        let result = prorate(
            date(2024, 3, 1),
            date(2024, 3, 31),
            date(2023, 12, 1),
            None,
        );
        assert_eq!(result.factor, 1.0);
        assert_eq!(result.rental_days, 31);
        assert_eq!(result.total_days, 31);
        assert_eq!(result.effective_start, date(2024, 3, 1));
        assert_eq!(result.effective_end, date(2024, 3, 31));
    }

    #[test]
    fn mid_month_start_prorates_inclusively() {
        // Contract starts 2024-03-16, open-ended: 16 of 31 days.
        let result = prorate(
            date(2024, 3, 1),
            date(2024, 3, 31),
            date(2024, 3, 16),
            None,
        );
        assert_eq!(result.rental_days, 16);
        assert_eq!(result.total_days, 31);
        assert!((result.factor - 16.0 / 31.0).abs() < 1e-12);
        assert_eq!(result.effective_start, date(2024, 3, 16));
    }

    #[test]
    fn contract_end_caps_the_effective_window() {
        let result = prorate(
            date(2024, 3, 1),
            date(2024, 3, 31),
            date(2024, 2, 1),
            Some(date(2024, 3, 10)),
        );
        assert_eq!(result.effective_end, date(2024, 3, 10));
        assert_eq!(result.rental_days, 10);
        assert!((result.factor - 10.0 / 31.0).abs() < 1e-12);
    }

    #[test]
    fn single_day_overlap_counts_one_day() {
        let result = prorate(
            date(2024, 3, 1),
            date(2024, 3, 31),
            date(2024, 3, 31),
            None,
        );
        assert_eq!(result.rental_days, 1);
    }

    #[test]
    fn overlap_predicate_filters_disjoint_contracts() {
        let start = date(2024, 3, 1);
        let end = date(2024, 3, 31);

        assert!(contract_overlaps_period(date(2024, 3, 16), None, start, end));
        assert!(contract_overlaps_period(
            date(2024, 1, 1),
            Some(date(2024, 3, 1)),
            start,
            end
        ));
        // ended before the period
        assert!(!contract_overlaps_period(
            date(2024, 1, 1),
            Some(date(2024, 2, 29)),
            start,
            end
        ));
        // starts after the period
        assert!(!contract_overlaps_period(date(2024, 4, 1), None, start, end));
    }
}
