//! Comma-separated user lists stored in the archive header
//!
//! Revision headers record creators and lockers as indices into the
//! modifier list, so the order of entries is significant and entries are
//! only ever appended.

use serde::{Deserialize, Serialize};

use crate::error::{QvcsError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessList {
    users: Vec<String>,
}

impl AccessList {
    /// Parse a comma-separated list. An empty string yields one empty entry,
    /// which the first `add_user` replaces.
    pub fn parse(list: &str) -> Self {
        Self { users: list.split(',').map(|user| user.trim().to_string()).collect() }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.iter().all(String::is_empty)
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.iter().any(|u| u == user)
    }

    pub fn index_to_user(&self, index: usize) -> Result<&str> {
        self.users
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| QvcsError::Format(format!("bad user index in access list: {}", index)))
    }

    /// Index of `user`, the last one if the list holds duplicates.
    pub fn user_to_index(&self, user: &str) -> Option<usize> {
        self.users.iter().rposition(|u| u == user)
    }

    /// Append `user` if absent. Returns true when the list changed.
    pub fn add_user(&mut self, user: &str) -> bool {
        if self.contains(user) {
            return false;
        }
        if self.users.len() == 1 && self.users[0].is_empty() {
            self.users[0] = user.to_string();
        } else {
            self.users.push(user.to_string());
        }
        true
    }

    /// Add `user` if needed and return its index.
    pub fn ensure_user(&mut self, user: &str) -> usize {
        self.add_user(user);
        self.user_to_index(user).unwrap_or(0)
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn to_comma_separated(&self) -> String {
        self.users.join(",")
    }
}

impl Default for AccessList {
    fn default() -> Self {
        Self::parse("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_entries() {
        let list = AccessList::parse("alice, bob ,carol");
        assert_eq!(list.len(), 3);
        assert_eq!(list.index_to_user(1).unwrap(), "bob");
        assert_eq!(list.user_to_index("carol"), Some(2));
        assert_eq!(list.user_to_index("dave"), None);
    }

    #[test]
    fn test_add_user_replaces_empty_sole_entry() {
        let mut list = AccessList::default();
        assert!(list.is_empty());
        assert!(list.add_user("alice"));
        assert_eq!(list.to_comma_separated(), "alice");
        assert!(!list.add_user("alice"));
        assert!(list.add_user("bob"));
        assert_eq!(list.to_comma_separated(), "alice,bob");
    }

    #[test]
    fn test_bad_index_is_format_error() {
        let list = AccessList::parse("alice");
        assert!(list.index_to_user(3).unwrap_err().is_corruption());
    }

    #[test]
    fn test_ensure_user_returns_stable_index() {
        let mut list = AccessList::parse("alice,bob");
        assert_eq!(list.ensure_user("bob"), 1);
        assert_eq!(list.ensure_user("carol"), 2);
        assert_eq!(list.len(), 3);
    }
}
