//! Ordered set of class labels the classifier predicts over.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Labels of the bundled lung CT classifier, in output-index order.
pub const DEFAULT_CLASS_NAMES: [&str; 4] = [
    "adenocarcinoma",
    "large_cell_carcinoma",
    "normal",
    "squamous_cell_carcinoma",
];

/// Class labels indexed by model output position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassSet {
    names: Vec<String>,
}

impl ClassSet {
    /// Build a class set, rejecting empty or duplicate labels
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::Config("class set must not be empty".into()));
        }
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(Error::Config(format!("class {} has an empty name", i)));
            }
            if names[..i].contains(name) {
                return Err(Error::Config(format!("duplicate class name '{}'", name)));
            }
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Output index for a label
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.names.iter().position(|n| n == label)
    }

    /// Label for an output index
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Resolve a label, failing with `InvalidLabel` when unknown
    pub fn resolve(&self, label: &str) -> Result<usize> {
        self.index_of(label).ok_or_else(|| Error::InvalidLabel {
            label: label.to_string(),
            expected: self.names.clone(),
        })
    }
}

impl Default for ClassSet {
    fn default() -> Self {
        Self {
            names: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        let classes = ClassSet::default();
        assert_eq!(classes.len(), 4);
        assert_eq!(classes.index_of("normal"), Some(2));
        assert_eq!(classes.name(3), Some("squamous_cell_carcinoma"));
        assert_eq!(classes.name(4), None);
    }

    #[test]
    fn test_resolve_unknown_label() {
        let classes = ClassSet::default();
        match classes.resolve("benign") {
            Err(Error::InvalidLabel { label, expected }) => {
                assert_eq!(label, "benign");
                assert_eq!(expected.len(), 4);
            }
            other => panic!("expected InvalidLabel, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert!(ClassSet::new(Vec::<String>::new()).is_err());
        assert!(ClassSet::new(["a", "b", "a"]).is_err());
        assert!(ClassSet::new(["a", " "]).is_err());
        assert!(ClassSet::new(["a", "b"]).is_ok());
    }
}
