//! Topic Trie for subscription matching
//!
//! A prefix tree keyed by topic level. Each node carries the value of a filter
//! ending at that level, literal children, a dedicated `+` child, and the value
//! of a `#` filter rooted at that level.
//!
//! - Traversal is iterator based, no Vec allocation per insert
//! - Levels are stored as `CompactString` (inline for short levels)
//! - Empty branches are pruned on removal so the trie tracks live filters only

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value of the filter terminating at this node
    value: Option<V>,
    /// Children indexed by literal topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Multi-level wildcard (#) value
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic Trie mapping topic filters to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Returns true when no filter is stored
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Get the value stored for a filter, inserting one built by `init` if absent
    pub fn get_or_insert_with<F>(&mut self, filter: &str, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                // Validation guarantees # is the final level
                return node.multi_wildcard.get_or_insert_with(init);
            }

            node = if level == "+" {
                node.single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                break;
            }
        }

        node.value.get_or_insert_with(init)
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.as_mut();
            } else if level == "+" {
                node = node.single_wildcard.as_mut()?;
            } else {
                node = node.children.get_mut(level)?;
            }

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter from the trie, pruning branches left empty
    /// Uses SmallVec to avoid heap allocation for typical topic depths (up to 8 levels)
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Keep only the values for which `keep` returns true, pruning empty branches
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::retain_recursive(&mut self.root, &mut keep);
    }

    fn retain_recursive<F>(node: &mut TrieNode<V>, keep: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if let Some(ref mut v) = node.value {
            if !keep(v) {
                node.value = None;
            }
        }

        if let Some(ref mut v) = node.multi_wildcard {
            if !keep(v) {
                node.multi_wildcard = None;
            }
        }

        if let Some(ref mut child) = node.single_wildcard {
            Self::retain_recursive(child, keep);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::retain_recursive(child, keep);
            !child.is_empty()
        });
    }

    /// Invoke `callback` for the value of every filter matching a topic name
    ///
    /// All branches are explored: the literal child, the `+` child and the `#`
    /// value at every level. A topic starting with `$` skips the wildcard
    /// branches at the root.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        let at_root = index == 0;

        // "a/#" also matches "a", so # is checked before consuming a level
        if !(is_system_topic && at_root) {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        let Some(&level) = levels.get(index) else {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        };

        if !(is_system_topic && at_root) {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<i32>, topic: &str) -> Vec<i32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        *trie.get_or_insert_with("test/topic", || 0) = 1;

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
        assert!(collect(&trie, "test").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("test/+", || 1);
        trie.get_or_insert_with("+/topic", || 2);
        trie.get_or_insert_with("+/+", || 3);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3]);
        assert!(collect(&trie, "test/topic/deep").is_empty());
    }

    #[test]
    fn test_multi_wildcard() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("#", || 1);
        trie.get_or_insert_with("test/#", || 2);

        assert_eq!(collect(&trie, "test/topic/deep"), vec![1, 2]);
        assert_eq!(collect(&trie, "test"), vec![1, 2]);
        assert_eq!(collect(&trie, "other"), vec![1]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("#", || 1);
        trie.get_or_insert_with("+/test", || 2);
        trie.get_or_insert_with("$SYS/#", || 3);

        assert_eq!(collect(&trie, "$SYS/test"), vec![3]);
    }

    #[test]
    fn test_get_or_insert_with_returns_existing() {
        let mut trie = TopicTrie::new();
        *trie.get_or_insert_with("a/+", || 0) += 5;
        *trie.get_or_insert_with("a/+", || 100) += 1;
        assert_eq!(trie.get_mut("a/+").copied(), Some(6));
    }

    #[test]
    fn test_remove_prunes_branches() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("test/topic", || 1);
        trie.get_or_insert_with("test/+/deep", || 2);

        assert_eq!(trie.remove("test/topic"), Some(1));
        assert!(collect(&trie, "test/topic").is_empty());
        assert_eq!(trie.remove("test/+/deep"), Some(2));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_remove_missing_filter() {
        let mut trie: TopicTrie<i32> = TopicTrie::new();
        trie.get_or_insert_with("a/b", || 1);
        assert_eq!(trie.remove("a/b/c"), None);
        assert_eq!(trie.remove("x"), None);
        assert_eq!(collect(&trie, "a/b"), vec![1]);
    }

    #[test]
    fn test_retain() {
        let mut trie = TopicTrie::new();
        trie.get_or_insert_with("a", || 1);
        trie.get_or_insert_with("a/#", || 2);
        trie.get_or_insert_with("+/b", || 3);

        trie.retain(|v| *v != 2);
        assert_eq!(collect(&trie, "a/b"), vec![3]);

        trie.retain(|_| false);
        assert!(trie.is_empty());
    }
}
