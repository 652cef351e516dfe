use serde_json::{Map, Value};

/// Coerce a JSON value holding a monetary amount into a plain `f64`.
///
/// Numeric columns arrive as JSON numbers through `row_to_json`, but rows
/// migrated from the previous system also carry amounts as strings or as the
/// serialized internals of its fixed-point library (a sign/digits/exponent
/// object). Decoding never fails; anything unparseable degrades to `0.0`.
pub fn normalize_amount(value: &Value) -> f64 {
    let amount = match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.trim().parse::<f64>().unwrap_or(0.0),
        Value::Object(fields) => decode_decimal_object(fields),
        _ => 0.0,
    };
    if amount.is_finite() {
        amount
    } else {
        0.0
    }
}

/// A missing or null reading is meaningfully different from a zero reading,
/// so this keeps the distinction `normalize_amount` erases.
pub fn optional_amount(value: Option<&Value>) -> Option<f64> {
    match value {
        None | Some(Value::Null) => None,
        Some(value) => Some(normalize_amount(value)),
    }
}

fn decode_decimal_object(fields: &Map<String, Value>) -> f64 {
    // {"s": sign, "d": [digit groups...], "e": exponent} is the fixed-point
    // library's internal shape.
    if let Some(digits) = fields.get("d").and_then(Value::as_array) {
        let sign = fields
            .get("s")
            .and_then(Value::as_i64)
            .map(|s| if s < 0 { -1.0 } else { 1.0 })
            .unwrap_or(1.0);

        if digits.len() == 1 {
            return sign * digits[0].as_f64().unwrap_or(0.0);
        }

        let joined = digits
            .iter()
            .filter_map(|digit| digit.as_u64())
            .map(|digit| digit.to_string())
            .collect::<String>();
        return sign * joined.parse::<f64>().unwrap_or(0.0);
    }

    // Some migrated rows wrap the amount one level down.
    if let Some(inner) = fields.get("value") {
        return normalize_amount(inner);
    }
    0.0
}

/// Round to two decimals for persisted totals. Calculation stays full
/// precision; rounding happens once at the persistence/display boundary.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn format_amount(amount: f64, currency: &str) -> String {
    match currency {
        "VND" => format!("₫{}", format_number_with_dots(amount.round() as i64)),
        "USD" => format!("${:.2}", amount),
        _ => format!("{:.2} {}", amount, currency),
    }
}

fn format_number_with_dots(n: i64) -> String {
    let (sign, magnitude) = if n < 0 {
        ("-", n.unsigned_abs())
    } else {
        ("", n.unsigned_abs())
    };
    let digits = magnitude.to_string();
    let mut grouped = String::new();
    for (index, character) in digits.chars().rev().enumerate() {
        if index > 0 && index % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(character);
    }
    format!("{sign}{}", grouped.chars().rev().collect::<String>())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{format_amount, normalize_amount, optional_amount, round2};

    #[test]
    fn passes_plain_numbers_through() {
        assert_eq!(normalize_amount(&json!(87500)), 87500.0);
        assert_eq!(normalize_amount(&json!(3500.5)), 3500.5);
    }

    #[test]
    fn parses_numeric_strings() {
        assert_eq!(normalize_amount(&json!("100000")), 100000.0);
        assert_eq!(normalize_amount(&json!(" 1250.75 ")), 1250.75);
        assert_eq!(normalize_amount(&json!("not a number")), 0.0);
    }

    #[test]
    fn decodes_fixed_point_internals() {
        assert_eq!(normalize_amount(&json!({"s": 1, "d": [87500], "e": 4})), 87500.0);
        assert_eq!(normalize_amount(&json!({"s": -1, "d": [120], "e": 2})), -120.0);
        assert_eq!(
            normalize_amount(&json!({"s": 1, "d": [1500000, 25], "e": 8})),
            150000025.0
        );
        assert_eq!(normalize_amount(&json!({"value": "42000"})), 42000.0);
    }

    #[test]
    fn degrades_to_zero_instead_of_failing() {
        assert_eq!(normalize_amount(&json!(null)), 0.0);
        assert_eq!(normalize_amount(&json!(true)), 0.0);
        assert_eq!(normalize_amount(&json!([1, 2])), 0.0);
        assert_eq!(normalize_amount(&json!({"unexpected": "shape"})), 0.0);
    }

    #[test]
    fn keeps_missing_distinct_from_zero() {
        assert_eq!(optional_amount(None), None);
        assert_eq!(optional_amount(Some(&json!(null))), None);
        assert_eq!(optional_amount(Some(&json!(0))), Some(0.0));
        assert_eq!(optional_amount(Some(&json!("145"))), Some(145.0));
    }

    #[test]
    fn rounds_and_formats_for_display() {
        assert_eq!(round2(51612.903225), 51612.9);
        assert_eq!(format_amount(1500000.0, "VND"), "₫1.500.000");
        assert_eq!(format_amount(12.5, "USD"), "$12.50");
        assert_eq!(format_amount(99.9, "EUR"), "99.90 EUR");
    }
}
