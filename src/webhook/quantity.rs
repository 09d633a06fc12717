//! Byte arithmetic on Kubernetes quantities.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY: [(&str, u32); 6] = [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5), ("Ei", 6)];
const DECIMAL: [(&str, i32); 8] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
];

/// Value of a quantity in base units; `None` if it does not parse.
pub fn parse(q: &Quantity) -> Option<f64> {
    let s = q.0.trim();
    if s.is_empty() {
        return None;
    }
    for (suffix, power) in BINARY {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.parse::<f64>().ok().map(|n| n * 1024f64.powi(power as i32));
        }
    }
    // "E" is both an exponent marker and the exa suffix; a trailing one is the suffix
    if let Some(num) = s.strip_suffix('E') {
        return num.parse::<f64>().ok().map(|n| n * 1e18);
    }
    for (suffix, exp) in DECIMAL {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.parse::<f64>().ok().map(|n| n * 10f64.powi(exp));
        }
    }
    s.parse::<f64>().ok()
}

/// Renders a byte count with the largest binary suffix that divides it.
pub fn format_bytes(bytes: u64) -> Quantity {
    if bytes == 0 {
        return Quantity("0".to_string());
    }
    for (suffix, power) in BINARY.iter().rev() {
        let unit = 1u64 << (10 * power);
        if bytes % unit == 0 {
            return Quantity(format!("{}{}", bytes / unit, suffix));
        }
    }
    Quantity(bytes.to_string())
}

/// `ratio` of `q`, rounded to whole bytes.
pub fn fraction(q: &Quantity, ratio: f64) -> Option<Quantity> {
    let bytes = parse(q)?;
    Some(format_bytes((bytes * ratio).round().max(0.0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse(&q("1Gi")), Some(1073741824.0));
        assert_eq!(parse(&q("500M")), Some(5e8));
        assert_eq!(parse(&q("250m")), Some(0.25));
        assert_eq!(parse(&q("1e3")), Some(1000.0));
        assert_eq!(parse(&q("2E")), Some(2e18));
        assert_eq!(parse(&q("12")), Some(12.0));
        assert_eq!(parse(&q("lots")), None);
        assert_eq!(parse(&q("")), None);
    }

    #[test]
    fn test_fraction() {
        assert_eq!(fraction(&q("2Gi"), 0.5), Some(q("1Gi")));
        assert_eq!(fraction(&q("10Gi"), 0.9), Some(q("9Gi")));
        assert_eq!(fraction(&q("3Gi"), 0.5), Some(q("1536Mi")));
        assert_eq!(fraction(&q("1000"), 0.5), Some(q("500")));
        assert_eq!(format_bytes(0), q("0"));
    }
}
