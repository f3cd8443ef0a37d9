//! Small shared helpers.

use std::time::Duration;

use anyhow::{anyhow, Result};

/// Parse a human duration string such as "30s", "5m", "72h", or "3d".
/// Bare numbers are interpreted as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty duration"));
    }

    let parse = |num: &str| -> Result<u64> {
        num.trim()
            .parse::<u64>()
            .map_err(|_| anyhow!("invalid duration: {s}"))
    };

    if let Some(num) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(num)?))
    } else if let Some(num) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(num)?.saturating_mul(60)))
    } else if let Some(num) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(num)?.saturating_mul(3600)))
    } else if let Some(num) = s.strip_suffix('d') {
        Ok(Duration::from_secs(parse(num)?.saturating_mul(86_400)))
    } else {
        // Bare numbers default to seconds
        Ok(Duration::from_secs(parse(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_suffixed_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("72h").unwrap(), Duration::from_secs(259_200));
        assert_eq!(parse_duration("3d").unwrap(), Duration::from_secs(259_200));
    }

    #[test]
    fn test_bare_numbers_are_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 60 ").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
