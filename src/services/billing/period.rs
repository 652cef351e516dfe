use chrono::{Datelike, NaiveDate, Utc};
use chrono_tz::Tz;

/// One invoice cycle, identified by its "YYYY-MM" label. The calendar window
/// (`start()`..=`end()`) is derived from it, never stored separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn parse(label: &str) -> Option<Self> {
        let (year, month) = label.trim().split_once('-')?;
        let year = year.parse::<i32>().ok()?;
        let month = month.parse::<u32>().ok()?;
        if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
            return None;
        }
        Some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The default batch period: the previous calendar month relative to now,
    /// resolved in the billing timezone.
    pub fn previous_month_in(tz: Tz) -> Self {
        Self::from_date(Utc::now().with_timezone(&tz).date_naive()).previous()
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn start(&self) -> NaiveDate {
        // Month is validated at construction, so the unwrap_or fallback is
        // unreachable in practice.
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date"))
    }

    pub fn end(&self) -> NaiveDate {
        self.next().start() - chrono::Duration::days(1)
    }

    /// Invoices fall due on `due_day` of the month following the period,
    /// clamped to that month's length.
    pub fn due_date(&self, due_day: u32) -> NaiveDate {
        let next = self.next();
        let last_day = next.end().day();
        let day = due_day.clamp(1, last_day);
        NaiveDate::from_ymd_opt(next.year, next.month, day).unwrap_or_else(|| next.start())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::BillingPeriod;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn parses_and_formats_labels() {
        let period = BillingPeriod::parse("2024-03").expect("valid period");
        assert_eq!(period.year, 2024);
        assert_eq!(period.month, 3);
        assert_eq!(period.label(), "2024-03");

        assert!(BillingPeriod::parse("2024-13").is_none());
        assert!(BillingPeriod::parse("2024-00").is_none());
        assert!(BillingPeriod::parse("2024").is_none());
        assert!(BillingPeriod::parse("march-2024").is_none());
    }

    #[test]
    fn derives_month_bounds() {
        let march = BillingPeriod::parse("2024-03").expect("valid period");
        assert_eq!(march.start(), date(2024, 3, 1));
        assert_eq!(march.end(), date(2024, 3, 31));

        // leap February
        let february = BillingPeriod::parse("2024-02").expect("valid period");
        assert_eq!(february.end(), date(2024, 2, 29));
    }

    #[test]
    fn steps_across_year_boundaries() {
        let january = BillingPeriod::parse("2025-01").expect("valid period");
        assert_eq!(january.previous().label(), "2024-12");
        assert_eq!(january.next().label(), "2025-02");
    }

    #[test]
    fn clamps_due_day_to_month_length() {
        let january = BillingPeriod::parse("2025-01").expect("valid period");
        assert_eq!(january.due_date(5), date(2025, 2, 5));
        assert_eq!(january.due_date(31), date(2025, 2, 28));
    }
}
