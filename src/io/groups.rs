//! Property groups derived from naming conventions
//!
//! DE servers name related properties `"<Group> - <Property>"`, for example
//! `"Scan - Size X"`. [`PropertyGroups`] indexes those names once after
//! discovery so callers can look up `("scan", "size_x")` without spelling
//! out the full name.

use std::collections::BTreeMap;

/// Separator between group and property in a full property name
pub const GROUP_SEPARATOR: &str = " - ";

/// `group -> (short key -> full property name)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyGroups {
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

/// Lowercase, spaces to underscores
fn slug(s: &str) -> String {
    s.trim().to_lowercase().replace(' ', "_")
}

impl PropertyGroups {
    /// Index every name of the form `"<Group> - <Property>"`
    ///
    /// Each property is reachable by its short name as written
    /// (`"Size X"`) and by its slug (`"size_x"`). Names without the
    /// separator belong to no group.
    ///
    /// # Examples
    ///
    /// ```
    /// use deapi::io::groups::PropertyGroups;
    ///
    /// let groups = PropertyGroups::from_names(["Scan - Size X", "Frames Per Second"]);
    /// assert_eq!(groups.resolve("Scan", "size_x"), Some("Scan - Size X"));
    /// assert_eq!(groups.resolve("scan", "Size X"), Some("Scan - Size X"));
    /// assert_eq!(groups.len(), 1);
    /// ```
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut groups: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            let Some((group, short)) = name.split_once(GROUP_SEPARATOR) else {
                continue;
            };
            let entry = groups.entry(slug(group)).or_default();
            entry.insert(slug(short), name.to_string());
            entry.insert(short.trim().to_string(), name.to_string());
        }
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group keys in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Short key to full name map of one group
    pub fn group(&self, group: &str) -> Option<&BTreeMap<String, String>> {
        self.groups.get(&slug(group))
    }

    /// Full property name for `group` and a short key
    pub fn resolve(&self, group: &str, key: &str) -> Option<&str> {
        let members = self.group(group)?;
        members
            .get(key.trim())
            .or_else(|| members.get(&slug(key)))
            .map(String::as_str)
    }

    /// Distinct full property names in one group
    pub fn members(&self, group: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .group(group)
            .map(|m| m.values().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names.dedup();
        names
    }
}
