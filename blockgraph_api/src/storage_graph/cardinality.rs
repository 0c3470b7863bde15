use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidCardinality {
    min_count: Option<usize>,
    max_count: Option<usize>,
}

impl ValidCardinality {
    pub fn new_zero() -> Self {
        Self::new_exact(0)
    }

    pub fn new_exact(v: usize) -> Self {
        Self {
            min_count: Some(v),
            max_count: Some(v),
        }
    }

    pub fn new_at_least(v: usize) -> Self {
        Self {
            min_count: Some(v),
            max_count: None,
        }
    }

    pub fn new_at_most(v: usize) -> Self {
        Self {
            min_count: None,
            max_count: Some(v),
        }
    }

    pub fn contains(&self, v: usize) -> bool {
        self.min_count.map_or(true, |min| min <= v) && self.max_count.map_or(true, |max| v <= max)
    }

    /// Returns pluralized form of the given word for this cardinality.
    pub fn pluralize<'a>(&self, singular: &'a str, plural: &'a str) -> &'a str {
        match (self.min_count, self.max_count) {
            (Some(1), Some(1)) | (Some(1), None) | (None, Some(1)) => singular,
            _ => plural,
        }
    }
}

impl std::fmt::Display for ValidCardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.min_count, self.max_count) {
            (Some(start), Some(end)) if start == end => write!(f, "exactly {start}"),
            (Some(start), Some(end)) => write!(f, "between {start} and {end}"),
            (Some(start), None) => write!(f, "at least {start}"),
            (None, Some(end)) => write!(f, "at most {end}"),
            (None, None) => write!(f, "any or none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_display() {
        let exact = ValidCardinality::new_exact(1);
        assert!(exact.contains(1));
        assert!(!exact.contains(0));
        assert_eq!(exact.to_string(), "exactly 1");
        assert_eq!(exact.pluralize("parent", "parents"), "parent");

        let at_least = ValidCardinality::new_at_least(3);
        assert!(!at_least.contains(2));
        assert!(at_least.contains(30));
        assert_eq!(at_least.to_string(), "at least 3");
        assert_eq!(at_least.pluralize("member", "members"), "members");

        assert!(ValidCardinality::new_zero().contains(0));
        assert!(ValidCardinality::new_at_most(1).contains(0));
        assert_eq!(ValidCardinality::new_at_most(1).to_string(), "at most 1");
    }
}
