use serde::{Deserialize, Serialize};

/// Insertion-ordered set of player ids. Serialized as a plain list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct OrderedSet {
    items: Vec<String>,
}

impl OrderedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` unless already present. Returns true if it was added.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.items.push(id);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item != id);
        before != self.items.len()
    }

    /// Replaces `from` with `to`, keeping its position.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if self.contains(to) {
            return self.remove(from);
        }
        match self.items.iter_mut().find(|item| item.as_str() == from) {
            Some(item) => {
                *item = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item == id)
    }

    pub fn first(&self) -> Option<&str> {
        self.items.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl From<Vec<String>> for OrderedSet {
    fn from(items: Vec<String>) -> Self {
        let mut set = OrderedSet::new();
        for item in items {
            set.insert(item);
        }
        set
    }
}

impl From<OrderedSet> for Vec<String> {
    fn from(set: OrderedSet) -> Self {
        set.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_ignores_duplicates() {
        let mut set = OrderedSet::new();
        assert!(set.insert("a"));
        assert!(set.insert("b"));
        assert!(!set.insert("a"));
        assert_eq!(set.to_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_and_position() {
        let mut set = OrderedSet::from(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(set.position("c"), Some(2));
        assert!(set.remove("b"));
        assert!(!set.remove("b"));
        assert_eq!(set.position("c"), Some(1));
        assert_eq!(set.first(), Some("a"));
    }

    #[test]
    fn test_rename_keeps_order() {
        let mut set = OrderedSet::from(vec!["a".to_string(), "b".to_string()]);
        assert!(set.rename("a", "z"));
        assert_eq!(set.to_vec(), vec!["z", "b"]);
        assert!(!set.rename("missing", "y"));
    }

    #[test]
    fn test_wire_list_deduplicates() {
        let set: OrderedSet = serde_json::from_str(r#"["a","b","a"]"#).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["a","b"]"#);
    }
}
