//! Kubernetes CPU quantity parsing

/// Parse a CPU quantity (`"250m"`, `"2"`, `"0.5"`, `"1500000n"`) into millicores
///
/// Returns `None` for anything that is not a non-negative CPU quantity.
pub fn parse_cpu_millicores(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    let (number, scale) = match quantity.char_indices().last() {
        Some((idx, 'n')) => (&quantity[..idx], 1e-6),
        Some((idx, 'u')) => (&quantity[..idx], 1e-3),
        Some((idx, 'm')) => (&quantity[..idx], 1.0),
        Some((idx, 'k')) => (&quantity[..idx], 1e6),
        _ => (quantity, 1000.0),
    };

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    Some((value * scale).round() as u64)
}
