//! Normalised word-overlap similarity used by duplicate-scheduled-item
//! suppression (`hasSimilarPendingScheduledItem`) and consolidation.

use std::collections::HashSet;

use crate::schema::ScheduledItem;

/// Scheduling verbs and stop-words stripped before computing overlap so
/// "remind me" boilerplate doesn't dominate the similarity score.
const IGNORED_WORDS: &[&str] = &[
    "the", "a", "an", "to", "me", "my", "remind", "reminder", "please",
    "can", "you", "at", "on", "in", "for", "and", "of", "every",
];

fn normalised_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| !w.is_empty() && !IGNORED_WORDS.contains(&w.as_str()))
        .collect()
}

/// Match if `overlap / smaller ≥ 0.8` or `overlap / either-side ≥ 0.4`.
pub fn word_overlap_similar(a: &str, b: &str) -> bool {
    let wa = normalised_words(a);
    let wb = normalised_words(b);
    if wa.is_empty() || wb.is_empty() {
        return false;
    }
    let overlap = wa.intersection(&wb).count() as f32;
    let smaller = wa.len().min(wb.len()) as f32;
    if overlap / smaller >= 0.8 {
        return true;
    }
    overlap / wa.len() as f32 >= 0.4 || overlap / wb.len() as f32 >= 0.4
}

/// Two pending scheduled items are duplicates when their messages overlap
/// and they fall within the same 7-day consolidation window.
pub fn scheduled_items_similar(a: &ScheduledItem, b: &ScheduledItem) -> bool {
    if a.id == b.id {
        return false;
    }
    let window = chrono::Duration::days(7);
    if (a.trigger_at - b.trigger_at).abs() > window {
        return false;
    }
    word_overlap_similar(&a.message, &b.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ScheduledItemType;
    use chrono::Utc;

    #[test]
    fn identical_reminders_are_similar() {
        assert!(word_overlap_similar(
            "remind me in 5 minutes to check the oven",
            "remind me to check the oven"
        ));
    }

    #[test]
    fn unrelated_reminders_are_not_similar() {
        assert!(!word_overlap_similar("check the oven", "call mom about dinner plans"));
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = "pick up dry cleaning tomorrow";
        let b = "remind me to pick up the dry cleaning";
        assert_eq!(word_overlap_similar(a, b), word_overlap_similar(b, a));
    }

    #[test]
    fn scheduled_items_outside_window_are_not_duplicates() {
        let now = Utc::now();
        let a = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", now);
        let mut b = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", now + chrono::Duration::days(10));
        b.id = uuid::Uuid::new_v4();
        assert!(!scheduled_items_similar(&a, &b));
    }
}
