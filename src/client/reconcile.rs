//! Convergence check between an optimistic shadow value and the persisted list.
//!
//! Pure and side-effect free: the same snapshot and shadow always give the
//! same verdict, so it can be re-run from any trigger as often as needed.

use crate::types::{Message, Role};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The snapshot does not reflect the shadow yet.
    Keep,
    /// The snapshot now holds the persisted copy; drop the shadow.
    Retire,
}

/// Optimistic copy of one message awaiting confirmation.
#[derive(Clone, Copy, Debug)]
pub struct Shadow<'a> {
    pub role: Role,
    pub text: &'a str,
    /// Persisted count captured when the shadow was created.
    pub baseline: usize,
}

impl<'a> Shadow<'a> {
    pub fn new(role: Role, text: &'a str, baseline: usize) -> Self {
        Self {
            role,
            text,
            baseline,
        }
    }

    /// Retire only when the list grew past the baseline and the latest
    /// message of the same role matches after trimming.
    pub fn verdict(&self, snapshot: &[Message]) -> Verdict {
        if snapshot.len() <= self.baseline {
            return Verdict::Keep;
        }
        let latest = snapshot.iter().rev().find(|m| m.role == self.role);
        match latest {
            Some(message) if message.content.trim() == self.text.trim() => Verdict::Retire,
            _ => Verdict::Keep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn msg(id: &str, role: Role, content: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c".into(),
            role,
            content: content.into(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn keeps_shadow_without_growth_even_if_content_matches() {
        let snapshot = vec![msg("1", Role::Assistant, "Virtue is...")];
        let shadow = Shadow::new(Role::Assistant, "Virtue is...", 1);
        assert_eq!(shadow.verdict(&snapshot), Verdict::Keep);
    }

    #[test]
    fn retires_when_grown_and_matching_after_trim() {
        let snapshot = vec![
            msg("1", Role::User, "What is virtue?"),
            msg("2", Role::Assistant, "  Virtue is...\n"),
        ];
        let shadow = Shadow::new(Role::Assistant, "Virtue is...", 0);
        assert_eq!(shadow.verdict(&snapshot), Verdict::Retire);
    }

    #[test]
    fn keeps_shadow_when_an_unrelated_message_arrived() {
        let snapshot = vec![
            msg("1", Role::User, "older question"),
            msg("2", Role::User, "someone else's question"),
        ];
        let shadow = Shadow::new(Role::User, "What is virtue?", 1);
        assert_eq!(shadow.verdict(&snapshot), Verdict::Keep);
    }

    #[test]
    fn only_the_latest_message_of_the_role_counts() {
        let snapshot = vec![
            msg("1", Role::User, "What is virtue?"),
            msg("2", Role::Assistant, "Knowledge."),
            msg("3", Role::User, "And justice?"),
        ];
        // An older user message matching does not count.
        assert_eq!(
            Shadow::new(Role::User, "What is virtue?", 2).verdict(&snapshot),
            Verdict::Keep
        );
        // The role filter skips the trailing user message.
        assert_eq!(
            Shadow::new(Role::Assistant, "Knowledge.", 2).verdict(&snapshot),
            Verdict::Retire
        );
    }

    #[test]
    fn empty_snapshot_keeps() {
        assert_eq!(
            Shadow::new(Role::User, "", 0).verdict(&[]),
            Verdict::Keep
        );
    }
}
