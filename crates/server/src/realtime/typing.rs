//! Typing indicators
//!
//! Entries expire after `TYPING_TTL`; a sweeper turns expired entries into
//! stop events so clients never show a stale indicator.

use crate::models::TypingIndicator;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

pub const TYPING_TTL_SECS: i64 = 5;

#[derive(Default)]
pub struct TypingTracker {
    /// (conversation_id, user_id) -> last keystroke
    entries: RwLock<HashMap<(String, String), DateTime<Utc>>>,
}

fn indicator(conversation_id: &str, user_id: &str, is_typing: bool) -> TypingIndicator {
    TypingIndicator {
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        is_typing,
        timestamp: Utc::now(),
    }
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, conversation_id: &str, user_id: &str) -> TypingIndicator {
        self.entries.write().insert(
            (conversation_id.to_string(), user_id.to_string()),
            Utc::now(),
        );
        indicator(conversation_id, user_id, true)
    }

    /// Some(stop event) if the user was typing
    pub fn stop(&self, conversation_id: &str, user_id: &str) -> Option<TypingIndicator> {
        self.entries
            .write()
            .remove(&(conversation_id.to_string(), user_id.to_string()))
            .map(|_| indicator(conversation_id, user_id, false))
    }

    /// Users currently typing in a conversation
    pub fn active(&self, conversation_id: &str) -> Vec<TypingIndicator> {
        let cutoff = Utc::now() - Duration::seconds(TYPING_TTL_SECS);
        let mut list: Vec<TypingIndicator> = self
            .entries
            .read()
            .iter()
            .filter(|((conv, _), at)| conv == conversation_id && **at > cutoff)
            .map(|((conv, user), at)| TypingIndicator {
                conversation_id: conv.clone(),
                user_id: user.clone(),
                is_typing: true,
                timestamp: *at,
            })
            .collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }

    /// Drop every entry of a user, returning the stop events
    pub fn clear_user(&self, user_id: &str) -> Vec<TypingIndicator> {
        let mut entries = self.entries.write();
        let keys: Vec<_> = entries
            .keys()
            .filter(|(_, user)| user == user_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                entries.remove(&key)?;
                Some(indicator(&key.0, &key.1, false))
            })
            .collect()
    }

    /// Drop expired entries, returning the stop events
    pub fn sweep(&self) -> Vec<TypingIndicator> {
        self.sweep_older_than(Utc::now() - Duration::seconds(TYPING_TTL_SECS))
    }

    fn sweep_older_than(&self, cutoff: DateTime<Utc>) -> Vec<TypingIndicator> {
        let mut entries = self.entries.write();
        let expired: Vec<_> = entries
            .iter()
            .filter(|(_, at)| **at <= cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired
            .into_iter()
            .map(|(conv, user)| indicator(&conv, &user, false))
            .collect()
    }
}
