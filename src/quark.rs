use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Background label name used when none is given.
pub const BACKGROUND_LABEL: &str = "O";

/// Two-way table between label names and their class ids.
///
/// Id 0 is always the background class; target classes follow in the
/// order they were first seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Quark {
    v: Vec<String>,
    m: HashMap<String, usize>,
}

impl Default for Quark {
    fn default() -> Self {
        Self::with_background(BACKGROUND_LABEL)
    }
}

impl From<Vec<String>> for Quark {
    fn from(value: Vec<String>) -> Self {
        let m = value.iter().enumerate().map(|(i, s)| (s.to_string(), i)).collect();
        Self { v: value, m }
    }
}

impl From<Quark> for Vec<String> {
    fn from(value: Quark) -> Self {
        value.v
    }
}

impl Quark {
    pub fn with_background(name: &str) -> Self {
        let mut this = Self { v: Vec::new(), m: HashMap::new() };
        this.find_or_insert(name);
        this
    }

    pub fn find_or_insert(&mut self, key: &str) -> usize {
        if let Some(&id) = self.m.get(key) {
            return id;
        }
        let id = self.v.len();
        self.m.insert(key.to_string(), id);
        self.v.push(key.to_string());
        id
    }

    pub fn to_str(&self, id: usize) -> Option<&str> {
        self.v.get(id).map(|x| x.as_str())
    }

    pub fn to_id(&self, s: &str) -> Option<usize> {
        self.m.get(s).copied()
    }

    /// Number of classes, background included.
    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Target class names, background excluded.
    pub fn targets(&self) -> &[String] {
        self.v.get(1..).unwrap_or(&[])
    }

    pub fn names(&self) -> &[String] {
        &self.v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_str() {
        let mut quark = Quark::default();
        for (s, id) in [("company", 1), ("person", 2), ("company", 1), ("O", 0), ("location", 3)] {
            assert_eq!(id, quark.find_or_insert(s), "{} != {}", s, id);
        }
        assert_eq!(quark.targets(), &["company", "person", "location"]);
    }

    #[test]
    fn find_by_id() {
        let mut quark = Quark::with_background("(Background)");
        quark.find_or_insert("speaker");
        assert_eq!(quark.to_str(0), Some("(Background)"));
        assert_eq!(quark.to_str(1), Some("speaker"));
        assert_eq!(quark.to_str(2), None);
        assert_eq!(quark.to_id("speaker"), Some(1));
    }

    #[test]
    fn serializes_as_name_list() {
        let mut quark = Quark::default();
        quark.find_or_insert("stime");
        let s = serde_json::to_string(&quark).unwrap();
        assert_eq!(s, r#"["O","stime"]"#);
        let back: Quark = serde_json::from_str(&s).unwrap();
        assert_eq!(back, quark);
    }
}
