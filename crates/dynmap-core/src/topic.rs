//! Topic level handling.
//!
//! Topics are split into levels *including* the separators, so `a//b` and
//! `a/b` stay distinguishable: `a//b` becomes `["a", "/", "/", "b"]`.

use crate::config::tokens::TOPIC_SEPARATOR;

/// Split a topic into levels, keeping every separator as its own token.
pub fn split_including_separator(topic: &str) -> Vec<String> {
    let mut levels = Vec::new();
    let mut current = String::new();
    for ch in topic.chars() {
        if ch == '/' {
            if !current.is_empty() {
                levels.push(std::mem::take(&mut current));
            }
            levels.push(TOPIC_SEPARATOR.to_string());
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        levels.push(current);
    }
    levels
}

/// Split a topic into its named levels, dropping leading and trailing
/// separators. Used to expose topic levels to substitutions.
pub fn split_excluding_separator(topic: &str) -> Vec<String> {
    topic
        .trim()
        .trim_matches('/')
        .split('/')
        .map(str::to_string)
        .collect()
}

/// Whether a level token is the separator.
pub fn is_separator(level: &str) -> bool {
    level == TOPIC_SEPARATOR
}
