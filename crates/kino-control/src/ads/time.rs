//! Time values found in ad documents

/// Parse a `HH:MM:SS[.mmm]` clock value into seconds
pub fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let (h, m, s) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if !digits(h) || !digits(m) {
        return None;
    }
    let (whole, fraction) = match s.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (s, None),
    };
    if !digits(whole) || fraction.is_some_and(|f| !digits(f)) {
        return None;
    }

    let hours: f64 = h.parse().ok()?;
    let minutes: f64 = m.parse().ok()?;
    let seconds: f64 = s.parse().ok()?;
    if minutes >= 60.0 || seconds >= 60.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse a `N%` value into its percentage
pub fn parse_percent(value: &str) -> Option<f64> {
    let p: f64 = value.trim().strip_suffix('%')?.trim().parse().ok()?;
    (p.is_finite() && p >= 0.0).then_some(p)
}

/// Resolve an offset that is either a clock value or a percentage of `duration`
///
/// Percentages are floored to whole seconds.
pub fn parse_offset(value: &str, duration: f64) -> Option<f64> {
    let value = value.trim();
    if value.ends_with('%') {
        let p = parse_percent(value)?;
        return Some((p / 100.0 * duration.max(0.0)).floor());
    }
    parse_clock(value)
}

/// `skipoffset` attribute; absent or unparseable means the ad is not skippable
pub fn parse_skip_offset(value: Option<&str>, duration: f64) -> Option<f64> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    parse_offset(value, duration)
}

/// Icon `offset`/`duration` attribute; zero or absent means "not set"
pub fn parse_icon_time(value: Option<&str>, duration: f64) -> Option<f64> {
    parse_offset(value?, duration).filter(|t| *t > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("00:00:30"), Some(30.0));
        assert_eq!(parse_clock("01:02:03"), Some(3723.0));
        assert_eq!(parse_clock("00:00:15.500"), Some(15.5));
        assert_eq!(parse_clock(" 00:01:00 "), Some(60.0));
        assert_eq!(parse_clock("30"), None);
        assert_eq!(parse_clock("00:61:00"), None);
        assert_eq!(parse_clock("aa:bb:cc"), None);
        assert_eq!(parse_clock("00:00:10.x"), None);
    }

    #[test]
    fn test_skip_offset() {
        assert_eq!(parse_skip_offset(Some("75%"), 120.0), Some(90.0));
        assert_eq!(parse_skip_offset(Some("00:00:30"), 120.0), Some(30.0));
        assert_eq!(parse_skip_offset(Some("33%"), 10.0), Some(3.0));
        assert_eq!(parse_skip_offset(Some("00:00:00"), 120.0), Some(0.0));
        assert_eq!(parse_skip_offset(None, 120.0), None);
        assert_eq!(parse_skip_offset(Some(""), 120.0), None);
        assert_eq!(parse_skip_offset(Some("soon"), 120.0), None);
        assert_eq!(parse_skip_offset(Some("x%"), 120.0), None);
    }

    #[test]
    fn test_icon_time() {
        assert_eq!(parse_icon_time(Some("00:00:05"), 30.0), Some(5.0));
        assert_eq!(parse_icon_time(Some("50%"), 30.0), Some(15.0));
        assert_eq!(parse_icon_time(Some("00:00:00"), 30.0), None);
        assert_eq!(parse_icon_time(None, 30.0), None);
    }
}
