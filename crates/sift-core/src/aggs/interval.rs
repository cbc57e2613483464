//! Calendar intervals and bucket-key formatting for date histograms.
//!
//! Truncation follows `date_trunc` semantics in UTC: weeks start on Monday,
//! quarters on January, April, July, and October.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, Timelike, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

impl Interval {
    /// Accepts unit names and the single-unit calendar shorthands (`1d`, `1M`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let interval = match raw {
            "year" | "1y" => Self::Year,
            "quarter" | "1q" => Self::Quarter,
            "month" | "1M" => Self::Month,
            "week" | "1w" => Self::Week,
            "day" | "1d" => Self::Day,
            "hour" | "1h" => Self::Hour,
            "minute" | "1m" => Self::Minute,
            "second" | "1s" => Self::Second,
            _ => return None,
        };
        Some(interval)
    }

    /// The `date_trunc` unit name.
    pub fn unit(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Quarter => "quarter",
            Self::Month => "month",
            Self::Week => "week",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }

    /// Truncate an epoch-millisecond instant to the start of its interval.
    pub fn truncate_millis(self, millis: i64) -> Option<i64> {
        let dt = DateTime::<Utc>::from_timestamp_millis(millis)?;
        let date = dt.date_naive();
        let start: NaiveDateTime = match self {
            Self::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
            Self::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1)?.and_hms_opt(0, 0, 0)?
            }
            Self::Month => {
                NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_hms_opt(0, 0, 0)?
            }
            Self::Week => {
                let back = u64::from(date.weekday().num_days_from_monday());
                date.checked_sub_days(Days::new(back))?.and_hms_opt(0, 0, 0)?
            }
            Self::Day => date.and_hms_opt(0, 0, 0)?,
            Self::Hour => date.and_hms_opt(dt.hour(), 0, 0)?,
            Self::Minute => date.and_hms_opt(dt.hour(), dt.minute(), 0)?,
            Self::Second => date.and_hms_opt(dt.hour(), dt.minute(), dt.second())?,
        };
        Some(start.and_utc().timestamp_millis())
    }
}

/// A `format` pattern for `key_as_string`, either a named format or a
/// `yyyy-MM-dd HH:mm:ss` style pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormat {
    pattern: String,
    render: Render,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Render {
    EpochMillis,
    EpochSecond,
    Strftime(String),
}

impl DateFormat {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let render = match pattern {
            "epoch_millis" => Render::EpochMillis,
            "epoch_second" => Render::EpochSecond,
            "date_optional_time" | "strict_date_optional_time" | "date_time" => {
                Render::Strftime("%Y-%m-%dT%H:%M:%S%.3fZ".into())
            }
            "date" | "strict_date" => Render::Strftime("%Y-%m-%d".into()),
            "basic_date" => Render::Strftime("%Y%m%d".into()),
            _ => Render::Strftime(translate_pattern(pattern)?),
        };
        Ok(Self {
            pattern: pattern.to_string(),
            render,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format_millis(&self, millis: i64) -> String {
        match &self.render {
            Render::EpochMillis => millis.to_string(),
            Render::EpochSecond => millis.div_euclid(1000).to_string(),
            Render::Strftime(fmt) => DateTime::<Utc>::from_timestamp_millis(millis)
                .map(|dt| dt.format(fmt).to_string())
                .unwrap_or_else(|| millis.to_string()),
        }
    }
}

fn translate_pattern(pattern: &str) -> Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // quoted literal; '' is an escaped quote
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '\'' {
                push_literal(&mut out, chars[j]);
                j += 1;
            }
            if j == i + 1 {
                out.push('\'');
            }
            i = j + 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }
        let run = chars[i..].iter().take_while(|&&x| x == c).count();
        let spec = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', _) => "%I",
            ('m', _) => "%M",
            ('s', _) => "%S",
            ('S', _) => "%3f",
            ('a', _) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('Z', _) | ('X', _) => "%z",
            _ => return Err(format!("unsupported date pattern letter [{c}] in [{pattern}]")),
        };
        out.push_str(spec);
        i += run;
    }
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_day_truncation_groups_same_day() {
        let keys: Vec<i64> = [0, 1000, DAY]
            .iter()
            .map(|&ms| Interval::Day.truncate_millis(ms).unwrap())
            .collect();
        assert_eq!(keys, vec![0, 0, DAY]);
    }

    #[test]
    fn test_week_starts_on_monday() {
        // 1970-01-01 was a Thursday; its week starts 1969-12-29.
        assert_eq!(Interval::Week.truncate_millis(0), Some(-3 * DAY));
    }

    #[test]
    fn test_quarter_and_year() {
        // 2024-05-17T10:00:00Z
        let ms = 1_715_940_000_000;
        let quarter = Interval::Quarter.truncate_millis(ms).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 4, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert_eq!(quarter, expected);
        let year = Interval::Year.truncate_millis(ms).unwrap();
        assert_eq!(year, 1_704_067_200_000);
    }

    #[test]
    fn test_negative_instants_truncate_downward() {
        assert_eq!(Interval::Day.truncate_millis(-1), Some(-DAY));
        assert_eq!(Interval::Hour.truncate_millis(-1), Some(-3_600_000));
    }

    #[test]
    fn test_parse_interval_shorthands() {
        assert_eq!(Interval::parse("1M"), Some(Interval::Month));
        assert_eq!(Interval::parse("1m"), Some(Interval::Minute));
        assert_eq!(Interval::parse("fortnight"), None);
    }

    #[test]
    fn test_format_patterns() {
        let f = DateFormat::parse("yyyy-MM-dd HH:mm:ss").unwrap();
        assert_eq!(f.format_millis(DAY + 1000), "1970-01-02 00:00:01");
        let f = DateFormat::parse("yyyy-MM-dd'T'HH").unwrap();
        assert_eq!(f.format_millis(0), "1970-01-01T00");
        let f = DateFormat::parse("epoch_millis").unwrap();
        assert_eq!(f.format_millis(1234), "1234");
        let f = DateFormat::parse("date_optional_time").unwrap();
        assert_eq!(f.format_millis(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_unknown_pattern_letter_is_rejected() {
        assert!(DateFormat::parse("yyyy-QQ").is_err());
    }
}
