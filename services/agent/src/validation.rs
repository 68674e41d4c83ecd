//! Lenient parsing of values coming from labels, env vars and target records.

const TRUTHY: &[&str] = &["1", "true", "on", "yes"];

/// Interprets a string flag. Unset or unrecognised values are false.
pub fn check_truthy(value: Option<&str>) -> bool {
    value.is_some_and(|v| TRUTHY.contains(&v.trim().to_ascii_lowercase().as_str()))
}

/// Parses a positive integer, rejecting zero unless `allow_zero` is set.
pub fn check_int(value: Option<&str>, allow_zero: bool) -> Option<u64> {
    let parsed = value?.trim().parse::<u64>().ok()?;
    if parsed == 0 && !allow_zero {
        return None;
    }
    Some(parsed)
}
