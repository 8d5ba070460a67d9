//! Wire types shared by the history client and the queue payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user profile as reported by the history source.
///
/// `real_name` and `email` are optional upstream and default empty so that
/// older payload shapes remain decodable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub email: String,
}

/// One message from a channel's history or a reply thread.
///
/// `ts` is the source-assigned timestamp string and doubles as the message's
/// external identifier (the natural dedup key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub text: String,
    pub author_id: String,
    pub ts: String,
    #[serde(default)]
    pub reply_count: i32,
}

/// A channel from the workspace listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// Parse a source timestamp string (`"seconds.fraction"` epoch form, the
/// fraction optional) into a UTC point in time.
///
/// Returns `None` for anything that does not parse; callers treat that as a
/// permanently malformed payload.
pub fn parse_source_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let (secs_part, frac_part) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };

    let secs: i64 = secs_part.parse().ok()?;

    let nanos: u32 = if frac_part.is_empty() {
        0
    } else {
        if frac_part.len() > 9 || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Right-pad to nanosecond precision
        let scale = 10u32.pow(9 - frac_part.len() as u32);
        frac_part.parse::<u32>().ok()? * scale
    };

    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_with_fraction() {
        let ts = parse_source_timestamp("1712345678.000100").unwrap();
        assert_eq!(ts.timestamp(), 1712345678);
        assert_eq!(ts.timestamp_subsec_micros(), 100);
    }

    #[test]
    fn test_parse_timestamp_whole_seconds() {
        let ts = parse_source_timestamp("1712345678").unwrap();
        assert_eq!(ts.timestamp(), 1712345678);
        assert_eq!(ts.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_source_timestamp("").is_none());
        assert!(parse_source_timestamp("not-a-ts").is_none());
        assert!(parse_source_timestamp("1712345678.12a4").is_none());
        assert!(parse_source_timestamp("1712345678.1234567890").is_none());
    }

    #[test]
    fn test_user_profile_optional_fields_default() {
        let user: UserProfile =
            serde_json::from_str(r#"{"id":"U1","name":"ada"}"#).unwrap();
        assert_eq!(user.real_name, "");
        assert_eq!(user.email, "");
    }
}
