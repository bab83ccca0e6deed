//! Helpers for deriving stable names.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

/// Converts a dash separated identifier into a single camel-style identifier.
///
/// # Examples
///
/// ```
/// use mjsuite::naming::to_camel_case;
///
/// assert_eq!(to_camel_case("array-sort"), "arraySort");
/// assert_eq!(to_camel_case("branch-misses"), "branchMisses");
/// ```
pub fn to_camel_case(s: &str) -> String {
    static DASH: OnceLock<Regex> = OnceLock::new();
    let dash = DASH.get_or_init(|| Regex::new(r"-(\w)").expect("dash pattern is valid"));
    dash.replace_all(s, |caps: &Captures<'_>| caps[1].to_uppercase())
        .into_owned()
}

/// Formats a point in time as `YYYY-MM-DD_HH-MM-SS`, suitable for file names.
pub fn timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn camel_case_leaves_plain_identifiers_alone() {
        assert_eq!(to_camel_case("regex"), "regex");
        assert_eq!(to_camel_case("task-clock"), "taskClock");
        assert_eq!(to_camel_case("proto-chain-2"), "protoChain2");
    }

    #[test]
    fn timestamp_is_file_name_friendly() {
        let time = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(timestamp(time), "2024-03-09_07-05-01");
    }
}
