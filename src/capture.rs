//! Manual and share-target capture.
//!
//! Quick capture recognises a few relative date words in free text, turns
//! them into a due date in the client's local time, and strips them from
//! the content.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Utc};
use regex::Regex;

use crate::models::TaskStatus;

struct Keyword {
    pattern: Regex,
    days_ahead: i64,
    hour: u32,
    status: TaskStatus,
}

fn keyword(pattern: &str, days_ahead: i64, hour: u32, status: TaskStatus) -> Keyword {
    Keyword {
        pattern: Regex::new(pattern).expect("valid keyword pattern"),
        days_ahead,
        hour,
        status,
    }
}

/// Checked in order; the first keyword found wins.
static KEYWORDS: LazyLock<Vec<Keyword>> = LazyLock::new(|| {
    vec![
        keyword(r"(?i)\btomorrow\b", 1, 12, TaskStatus::Inbox),
        keyword(r"(?i)\btoday\b", 0, 12, TaskStatus::Today),
        keyword(r"(?i)\btonight\b", 0, 19, TaskStatus::Today),
        keyword(r"(?i)\bnext\s+week\b", 7, 12, TaskStatus::Inbox),
    ]
});

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCapture {
    pub content: String,
    pub due_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

/// Offset in minutes east of UTC (CEST is +120). Out-of-range values fall back to UTC.
pub fn local_offset(tz_offset_minutes: i32) -> FixedOffset {
    tz_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

pub fn parse_date_keywords(text: &str, now: DateTime<Utc>, offset: FixedOffset) -> ParsedCapture {
    let trimmed = text.trim();

    for kw in KEYWORDS.iter() {
        if !kw.pattern.is_match(trimmed) {
            continue;
        }
        let stripped = kw.pattern.replace(trimmed, "").trim().to_string();
        let content = if stripped.is_empty() { trimmed.to_string() } else { stripped };

        let local_day = now.with_timezone(&offset).date_naive() + Duration::days(kw.days_ahead);
        let due_at = NaiveTime::from_hms_opt(kw.hour, 0, 0)
            .and_then(|time| local_day.and_time(time).and_local_timezone(offset).single())
            .map(|local| local.with_timezone(&Utc));

        return ParsedCapture { content, due_at, status: kw.status };
    }

    ParsedCapture {
        content: trimmed.to_string(),
        due_at: None,
        status: TaskStatus::Inbox,
    }
}

/// Join the parts of a share-target payload into task content.
/// None when every part is blank.
pub fn share_content(title: Option<&str>, text: Option<&str>, url: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [title, text, url]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 11, 10, 0, 0).unwrap()
    }

    fn utc() -> FixedOffset {
        local_offset(0)
    }

    #[test]
    fn tomorrow_goes_to_inbox_at_noon() {
        let parsed = parse_date_keywords("Buy milk tomorrow", now(), utc());
        assert_eq!(parsed.content, "Buy milk");
        assert_eq!(parsed.due_at, Some(Utc.with_ymd_and_hms(2026, 2, 12, 12, 0, 0).unwrap()));
        assert_eq!(parsed.status, TaskStatus::Inbox);
    }

    #[test]
    fn tonight_is_today_at_seven() {
        let parsed = parse_date_keywords("Call mom TONIGHT", now(), utc());
        assert_eq!(parsed.content, "Call mom");
        assert_eq!(parsed.due_at, Some(Utc.with_ymd_and_hms(2026, 2, 11, 19, 0, 0).unwrap()));
        assert_eq!(parsed.status, TaskStatus::Today);
    }

    #[test]
    fn next_week_adds_seven_days() {
        let parsed = parse_date_keywords("next week plan offsite", now(), utc());
        assert_eq!(parsed.content, "plan offsite");
        assert_eq!(parsed.due_at, Some(Utc.with_ymd_and_hms(2026, 2, 18, 12, 0, 0).unwrap()));
        assert_eq!(parsed.status, TaskStatus::Inbox);
    }

    #[test]
    fn tomorrow_has_priority_and_only_first_is_removed() {
        let parsed = parse_date_keywords("today or tomorrow, tomorrow latest", now(), utc());
        assert_eq!(parsed.content, "today or , tomorrow latest");
        assert_eq!(parsed.status, TaskStatus::Inbox);
    }

    #[test]
    fn word_boundaries_respected() {
        let parsed = parse_date_keywords("Read todays paper", now(), utc());
        assert_eq!(parsed.content, "Read todays paper");
        assert_eq!(parsed.due_at, None);
    }

    #[test]
    fn local_day_follows_client_offset() {
        // 23:30 UTC is already the 12th in UTC+2.
        let late = Utc.with_ymd_and_hms(2026, 2, 11, 23, 30, 0).unwrap();
        let parsed = parse_date_keywords("Pay rent tomorrow", late, local_offset(120));
        assert_eq!(parsed.due_at, Some(Utc.with_ymd_and_hms(2026, 2, 13, 10, 0, 0).unwrap()));
    }

    #[test]
    fn bare_keyword_keeps_text() {
        let parsed = parse_date_keywords("  tomorrow ", now(), utc());
        assert_eq!(parsed.content, "tomorrow");
        assert!(parsed.due_at.is_some());
    }

    #[test]
    fn share_joins_non_blank_parts() {
        assert_eq!(
            share_content(Some("Recipe"), Some("  "), Some("https://example.org/r")),
            Some("Recipe\nhttps://example.org/r".to_string())
        );
        assert_eq!(share_content(None, Some(" "), None), None);
    }
}
