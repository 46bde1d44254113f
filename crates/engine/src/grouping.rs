//! Device grouping.
//!
//! Partitions a batch into per-platform buckets.

use std::collections::HashMap;

use fanout_common::types::Recipient;

/// Group recipients by device platform tag.
///
/// Recipients with no tag (or a blank one) are dropped. Within a bucket the
/// input order is preserved; the order of buckets is unspecified.
pub fn group_by_device(recipients: &[Recipient]) -> HashMap<&str, Vec<&Recipient>> {
    let mut groups: HashMap<&str, Vec<&Recipient>> = HashMap::new();
    for recipient in recipients {
        let Some(device) = recipient.device.as_deref().map(str::trim) else {
            continue;
        };
        if device.is_empty() {
            continue;
        }
        groups.entry(device).or_default().push(recipient);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fanout_common::types::platform;
    use uuid::Uuid;

    fn recipient(device: Option<&str>, token: &str) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            email: None,
            name: None,
            device: device.map(str::to_string),
            device_token: Some(token.to_string()),
            created_at: Utc::now(),
        }
    }

    fn tokens(group: &[&Recipient]) -> Vec<String> {
        group
            .iter()
            .filter_map(|r| r.device_token.clone())
            .collect()
    }

    #[test]
    fn test_groups_three_and_three() {
        let recipients = vec![
            recipient(Some("ios"), "ios1"),
            recipient(Some("android"), "android1"),
            recipient(Some("ios"), "ios2"),
            recipient(Some("android"), "android2"),
            recipient(Some("ios"), "ios3"),
            recipient(Some("android"), "android3"),
        ];
        let groups = group_by_device(&recipients);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[platform::IOS].len(), 3);
        assert_eq!(groups[platform::ANDROID].len(), 3);
    }

    #[test]
    fn test_preserves_order_within_group() {
        let recipients = vec![
            recipient(Some("ios"), "c"),
            recipient(Some("android"), "x"),
            recipient(Some("ios"), "a"),
            recipient(Some("ios"), "b"),
        ];
        let groups = group_by_device(&recipients);
        assert_eq!(tokens(&groups["ios"]), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_idempotent() {
        let recipients = vec![
            recipient(Some("ios"), "ios1"),
            recipient(Some("android"), "android1"),
            recipient(Some("web"), "web1"),
        ];
        let first = group_by_device(&recipients);
        let second = group_by_device(&recipients);
        assert_eq!(first, second);
    }

    #[test]
    fn test_drops_missing_and_blank_tags() {
        let recipients = vec![
            recipient(None, "none"),
            recipient(Some("  "), "blank"),
            recipient(Some("android"), "android1"),
        ];
        let groups = group_by_device(&recipients);
        assert_eq!(groups.len(), 1);
        assert_eq!(tokens(&groups["android"]), vec!["android1"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(group_by_device(&[]).is_empty());
    }
}
