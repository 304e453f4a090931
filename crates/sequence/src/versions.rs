use serde::Serialize;
use snafu::ensure;

use crate::error::{OutOfRangeSnafu, SequenceResult};

/// Append-only history of one element with a single active pointer.
///
/// `active` is `None` until the first version arrives and afterwards always indexes
/// into `versions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionedElement {
    #[serde(rename = "list")]
    versions: Vec<String>,
    #[serde(rename = "current_version")]
    active: Option<usize>,
}

impl VersionedElement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a history read back from storage.
    pub fn from_parts(versions: Vec<String>, active: Option<usize>) -> SequenceResult<Self> {
        if let Some(index) = active {
            ensure!(
                index < versions.len(),
                OutOfRangeSnafu {
                    stage: "versioned-element-from-parts",
                    index,
                    len: versions.len(),
                }
            );
        }

        Ok(Self { versions, active })
    }

    /// Active content, or `None` while no version exists.
    pub fn current(&self) -> Option<&str> {
        self.active
            .and_then(|index| self.versions.get(index))
            .map(String::as_str)
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.versions.len() {
            return false;
        }

        self.active = Some(index);
        true
    }

    pub fn append_and_activate(&mut self, content: impl Into<String>) -> usize {
        self.versions.push(content.into());
        let index = self.versions.len() - 1;
        self.active = Some(index);
        index
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.versions.get(index).map(String::as_str)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_is_not_set_and_rejects_selection() {
        let mut element = VersionedElement::new();

        assert_eq!(element.current(), None);
        assert!(!element.select(0));
        assert_eq!(element.active_index(), None);
    }

    #[test]
    fn append_activates_the_newest_version() {
        let mut element = VersionedElement::new();

        assert_eq!(element.append_and_activate("first"), 0);
        assert_eq!(element.append_and_activate("second"), 1);

        assert_eq!(element.current(), Some("second"));
        assert_eq!(element.active_index(), Some(element.len() - 1));
    }

    #[test]
    fn empty_content_is_distinct_from_not_set() {
        let mut element = VersionedElement::new();
        element.append_and_activate("");

        assert_eq!(element.current(), Some(""));
    }

    #[test]
    fn rejected_selection_leaves_active_unchanged() {
        let mut element = VersionedElement::new();
        element.append_and_activate("a");
        element.append_and_activate("b");
        element.append_and_activate("c");
        assert!(element.select(1));

        assert!(!element.select(3));
        assert!(!element.select(usize::MAX));
        assert_eq!(element.active_index(), Some(1));
        assert_eq!(element.current(), Some("b"));
    }

    #[test]
    fn from_parts_validates_active_pointer() {
        let versions = vec!["a".to_string(), "b".to_string()];

        let restored = VersionedElement::from_parts(versions.clone(), Some(1)).expect("valid");
        assert_eq!(restored.current(), Some("b"));

        assert!(VersionedElement::from_parts(versions, Some(2)).is_err());
        assert!(VersionedElement::from_parts(Vec::new(), None).is_ok());
    }
}
