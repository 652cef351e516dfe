/// Bill lifecycle. `Paid` is terminal for this subsystem; cancellation and
/// other terminal states belong to upstream workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillStatus {
    Draft,
    Pending,
    Paid,
}

impl BillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterUpdateTransition {
    pub next: BillStatus,
    /// True only on the specific draft → pending flip; drives the one-shot
    /// "bill ready" notification.
    pub became_ready: bool,
}

/// Status of a freshly generated bill. Manual bills start pending
/// unconditionally (their meter data, if any, was supplied at creation).
pub fn initial_status(is_auto_generated: bool, requires_meter_data: bool) -> BillStatus {
    if is_auto_generated && requires_meter_data {
        BillStatus::Draft
    } else {
        BillStatus::Pending
    }
}

/// Re-derive status after a meter-data recalculation. Pending never regresses
/// to draft, and paid is untouchable (callers reject paid bills before any
/// recalculation).
pub fn after_meter_update(current: BillStatus, requires_meter_data: bool) -> MeterUpdateTransition {
    match current {
        BillStatus::Draft if !requires_meter_data => MeterUpdateTransition {
            next: BillStatus::Pending,
            became_ready: true,
        },
        other => MeterUpdateTransition {
            next: other,
            became_ready: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{after_meter_update, initial_status, BillStatus};

    #[test]
    fn round_trips_status_strings() {
        for status in [BillStatus::Draft, BillStatus::Pending, BillStatus::Paid] {
            assert_eq!(BillStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BillStatus::parse("PAID"), Some(BillStatus::Paid));
        assert_eq!(BillStatus::parse("cancelled"), None);
    }

    #[test]
    fn auto_bills_start_draft_only_when_readings_are_missing() {
        assert_eq!(initial_status(true, true), BillStatus::Draft);
        assert_eq!(initial_status(true, false), BillStatus::Pending);
        assert_eq!(initial_status(false, true), BillStatus::Pending);
        assert_eq!(initial_status(false, false), BillStatus::Pending);
    }

    #[test]
    fn completing_readings_flips_draft_to_pending_exactly_once() {
        let first = after_meter_update(BillStatus::Draft, false);
        assert_eq!(first.next, BillStatus::Pending);
        assert!(first.became_ready);

        // a second identical submission is a no-op transition
        let second = after_meter_update(first.next, false);
        assert_eq!(second.next, BillStatus::Pending);
        assert!(!second.became_ready);
    }

    #[test]
    fn incomplete_readings_keep_the_bill_in_draft() {
        let result = after_meter_update(BillStatus::Draft, true);
        assert_eq!(result.next, BillStatus::Draft);
        assert!(!result.became_ready);
    }

    #[test]
    fn pending_never_regresses() {
        let result = after_meter_update(BillStatus::Pending, true);
        assert_eq!(result.next, BillStatus::Pending);
        assert!(!result.became_ready);
    }
}
