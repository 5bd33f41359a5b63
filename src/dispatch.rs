//! C6 — the ordered action dispatcher (§4.6).
//!
//! A `Vec<(Regex, Action)>`, never a `HashMap`: evaluation order is part of
//! the contract (the first matching pattern wins), and a hash map has no
//! order to preserve.

use std::sync::LazyLock;

use regex::Regex;

/// What a changelog action resolves to once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Update,
    /// `filename` is `Some` only for a `remove file <name>` action; a bare
    /// `remove` deletes the whole project or version instead.
    Delete { filename: Option<String> },
}

struct Rule {
    pattern: Regex,
    action: fn(&regex::Captures) -> Action,
}

static DISPATCH_TABLE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule {
            pattern: Regex::new(r"^create$").unwrap(),
            action: |_| Action::Update,
        },
        Rule {
            pattern: Regex::new(r"^new release$").unwrap(),
            action: |_| Action::Update,
        },
        Rule {
            pattern: Regex::new(r"^add [\w\d.]+ file .+$").unwrap(),
            action: |_| Action::Update,
        },
        Rule {
            pattern: Regex::new(r"^remove$").unwrap(),
            action: |_| Action::Delete { filename: None },
        },
        Rule {
            pattern: Regex::new(r"^remove file (.+)$").unwrap(),
            action: |caps| Action::Delete {
                filename: caps.get(1).map(|m| m.as_str().to_string()),
            },
        },
        Rule {
            pattern: Regex::new(r"^update [\w]+(, [\w]+)*$").unwrap(),
            action: |_| Action::Update,
        },
    ]
});

/// Resolves a raw changelog action string to an [`Action`] by walking the
/// table in order and returning on the first match. `None` means the
/// action is unrecognized and should be logged and skipped, not errored.
pub fn dispatch(raw_action: &str) -> Option<Action> {
    DISPATCH_TABLE
        .iter()
        .find_map(|rule| rule.pattern.captures(raw_action).map(|caps| (rule.action)(&caps)))
}
