use serde::Serialize;

use super::proration::Proration;

/// A room cost after the meter-override merge, ready for calculation. Each
/// kind carries only the fields it needs so the calculator can match
/// exhaustively; adding a kind forces every site to handle it.
#[derive(Debug, Clone, PartialEq)]
pub enum CostKind {
    Fixed {
        amount: f64,
    },
    PerPerson {
        amount_per_person: f64,
    },
    Metered {
        unit_price: f64,
        unit: String,
        meter_reading: Option<f64>,
        last_meter_reading: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct CostDefinition {
    pub room_cost_id: String,
    pub name: String,
    pub currency: String,
    pub kind: CostKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LineItem {
    pub item_type: String,
    pub item_name: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct BillComputation {
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    pub requires_meter_data: bool,
}

/// Expand cost definitions plus base rent into the line items of one bill.
///
/// Pure: no I/O, deterministic for a given input. A metered cost missing
/// either reading is skipped (not billed, not an error) and flips
/// `requires_meter_data`; items that price out at zero or below are dropped.
pub fn calculate_bill_items(
    costs: &[CostDefinition],
    occupancy_count: i64,
    proration: &Proration,
    base_rent_monthly: Option<f64>,
    default_currency: &str,
) -> BillComputation {
    let mut items = Vec::with_capacity(costs.len() + 1);
    let mut requires_meter_data = false;

    if let Some(base_rent) = base_rent_monthly {
        let amount = base_rent * proration.factor;
        if amount > 0.0 {
            let percent = (proration.factor * 100.0).round() as i64;
            items.push(LineItem {
                item_type: "rent".to_string(),
                item_name: "Monthly rent".to_string(),
                description: format!("Base rent for {percent}% of the billing period"),
                quantity: 1.0,
                unit_price: amount,
                amount,
                currency: default_currency.to_string(),
            });
        }
    }

    for cost in costs {
        let currency = if cost.currency.trim().is_empty() {
            default_currency.to_string()
        } else {
            cost.currency.clone()
        };

        let item = match &cost.kind {
            CostKind::Fixed { amount } => {
                let total = amount * proration.factor;
                LineItem {
                    item_type: "fixed".to_string(),
                    item_name: cost.name.clone(),
                    description: String::new(),
                    quantity: 1.0,
                    unit_price: total,
                    amount: total,
                    currency,
                }
            }
            CostKind::PerPerson { amount_per_person } => {
                let occupants = occupancy_count.max(0);
                let total = amount_per_person * occupants as f64 * proration.factor;
                let quantity = occupants as f64;
                LineItem {
                    item_type: "per_person".to_string(),
                    item_name: format!("{} ({} occupants)", cost.name, occupants),
                    description: String::new(),
                    quantity,
                    unit_price: if quantity > 0.0 { total / quantity } else { 0.0 },
                    amount: total,
                    currency,
                }
            }
            CostKind::Metered {
                unit_price,
                unit,
                meter_reading,
                last_meter_reading,
            } => {
                let (Some(current), Some(last)) = (meter_reading, last_meter_reading) else {
                    // Cannot bill consumption without both readings; the bill
                    // stays in draft until they arrive.
                    requires_meter_data = true;
                    continue;
                };
                let usage = (current - last).max(0.0);
                LineItem {
                    item_type: "metered".to_string(),
                    item_name: cost.name.clone(),
                    description: format!("{usage} {unit} used (reading {last} to {current})"),
                    quantity: usage,
                    unit_price: *unit_price,
                    amount: usage * unit_price,
                    currency,
                }
            }
        };

        if item.amount > 0.0 {
            items.push(item);
        }
    }

    let subtotal = items.iter().map(|item| item.amount).sum();

    BillComputation {
        items,
        subtotal,
        requires_meter_data,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::super::proration::prorate;
    use super::{calculate_bill_items, CostDefinition, CostKind};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn march_full() -> super::super::proration::Proration {
        prorate(date(2024, 3, 1), date(2024, 3, 31), date(2023, 1, 1), None)
    }

    fn cost(name: &str, kind: CostKind) -> CostDefinition {
        CostDefinition {
            room_cost_id: format!("cost-{name}"),
            name: name.to_string(),
            currency: "VND".to_string(),
            kind,
        }
    }

    #[test]
    fn prorates_fixed_costs_mid_month() {
        // Contract from 2024-03-16: 16/31 of a 100,000 fixed cost.
        let proration = prorate(date(2024, 3, 1), date(2024, 3, 31), date(2024, 3, 16), None);
        let costs = vec![cost("Internet", CostKind::Fixed { amount: 100_000.0 })];

        let result = calculate_bill_items(&costs, 1, &proration, None, "VND");

        assert_eq!(result.items.len(), 1);
        let expected = 100_000.0 * 16.0 / 31.0;
        assert!((result.items[0].amount - expected).abs() < 1e-9);
        assert!(!result.requires_meter_data);
    }

    #[test]
    fn bills_metered_usage_at_unit_price() {
        // 145 - 120 = 25 kWh at 3,500 each.
        let costs = vec![cost(
            "Electricity",
            CostKind::Metered {
                unit_price: 3_500.0,
                unit: "kWh".to_string(),
                meter_reading: Some(145.0),
                last_meter_reading: Some(120.0),
            },
        )];

        let result = calculate_bill_items(&costs, 1, &march_full(), None, "VND");

        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].quantity, 25.0);
        assert_eq!(result.items[0].unit_price, 3_500.0);
        assert_eq!(result.items[0].amount, 87_500.0);
    }

    #[test]
    fn skips_metered_costs_missing_a_reading() {
        let costs = vec![
            cost(
                "Electricity",
                CostKind::Metered {
                    unit_price: 3_500.0,
                    unit: "kWh".to_string(),
                    meter_reading: Some(145.0),
                    last_meter_reading: None,
                },
            ),
            cost("Trash", CostKind::Fixed { amount: 20_000.0 }),
        ];

        let result = calculate_bill_items(&costs, 1, &march_full(), None, "VND");

        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].item_name, "Trash");
        assert!(result.requires_meter_data);
    }

    #[test]
    fn meter_rollover_never_goes_negative() {
        let costs = vec![cost(
            "Water",
            CostKind::Metered {
                unit_price: 10_000.0,
                unit: "m3".to_string(),
                meter_reading: Some(5.0),
                last_meter_reading: Some(12.0),
            },
        )];

        let result = calculate_bill_items(&costs, 1, &march_full(), None, "VND");

        // usage clamps to 0 and the zero-amount line is dropped
        assert!(result.items.is_empty());
        assert_eq!(result.subtotal, 0.0);
    }

    #[test]
    fn scales_per_person_costs_by_occupancy() {
        let costs = vec![cost(
            "Cleaning",
            CostKind::PerPerson {
                amount_per_person: 50_000.0,
            },
        )];

        let result = calculate_bill_items(&costs, 3, &march_full(), None, "VND");

        assert_eq!(result.items.len(), 1);
        let item = &result.items[0];
        assert_eq!(item.item_name, "Cleaning (3 occupants)");
        assert_eq!(item.quantity, 3.0);
        assert_eq!(item.amount, 150_000.0);
        assert!((item.amount - item.quantity * item.unit_price).abs() < 1e-9);
    }

    #[test]
    fn emits_rent_item_with_proration_note() {
        let proration = prorate(date(2024, 3, 1), date(2024, 3, 31), date(2024, 3, 16), None);
        let result = calculate_bill_items(&[], 1, &proration, Some(3_100_000.0), "VND");

        assert_eq!(result.items.len(), 1);
        let rent = &result.items[0];
        assert_eq!(rent.item_type, "rent");
        assert_eq!(rent.quantity, 1.0);
        assert_eq!(rent.unit_price, rent.amount);
        assert!(rent.description.contains("52%"));
        assert!((rent.amount - 3_100_000.0 * 16.0 / 31.0).abs() < 1e-9);
    }

    #[test]
    fn subtotal_matches_item_sum() {
        let costs = vec![
            cost("Internet", CostKind::Fixed { amount: 100_000.0 }),
            cost(
                "Electricity",
                CostKind::Metered {
                    unit_price: 3_500.0,
                    unit: "kWh".to_string(),
                    meter_reading: Some(145.0),
                    last_meter_reading: Some(120.0),
                },
            ),
            cost(
                "Cleaning",
                CostKind::PerPerson {
                    amount_per_person: 25_000.0,
                },
            ),
        ];

        let result = calculate_bill_items(&costs, 2, &march_full(), Some(2_000_000.0), "VND");

        let item_sum: f64 = result.items.iter().map(|item| item.amount).sum();
        assert!((result.subtotal - item_sum).abs() < 1e-9);
        assert_eq!(result.items.len(), 4);
    }
}
