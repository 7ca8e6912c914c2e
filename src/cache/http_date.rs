//! HTTP date parsing (RFC 7231 §7.1.1.1).
//!
//! Only the preferred IMF-fixdate form is generated by modern servers;
//! the two obsolete forms are still accepted on parse.

use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

const IMF_FIXDATE: &[time::format_description::FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

const RFC850: &[time::format_description::FormatItem<'_>] = format_description!(
    "[weekday repr:long], [day]-[month repr:short]-[year repr:last_two] [hour]:[minute]:[second] GMT"
);

const ASCTIME: &[time::format_description::FormatItem<'_>] = format_description!(
    "[weekday repr:short] [month repr:short] [day padding:space] [hour]:[minute]:[second] [year]"
);

/// Parse an HTTP date header value. All three RFC 7231 forms are GMT.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    for format in [IMF_FIXDATE, RFC850, ASCTIME] {
        if let Ok(parsed) = PrimitiveDateTime::parse(value, format) {
            return Some(parsed.assume_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imf_fixdate() {
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(parsed.year(), 1994);
        assert_eq!(parsed.unix_timestamp(), 784111777);
    }

    #[test]
    fn test_asctime() {
        let parsed = parse_http_date("Sun Nov  6 08:49:37 1994").unwrap();
        assert_eq!(parsed.unix_timestamp(), 784111777);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_http_date("not a date").is_none());
        assert!(parse_http_date("").is_none());
    }
}
