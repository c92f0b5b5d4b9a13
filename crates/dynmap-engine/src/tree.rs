//! Wildcard-aware topic trie.
//!
//! Topics are split into levels with separators kept as their own tokens, so
//! `a//b` and `a/b` follow different paths. A child token is either a literal
//! level, the single-level wildcard `+` or the multi-level wildcard `#`.
//!
//! The committed tree is an immutable snapshot behind an `Arc`. Readers clone
//! the pointer and walk it without further locking. Writers are serialised by
//! one mutex, copy the nodes on the path they touch and publish the new root
//! only after the whole mutation succeeded, so a failed insert is never
//! visible.

use dynmap_core::config::tokens::{TOPIC_WILDCARD_MULTI, TOPIC_WILDCARD_SINGLE};
use dynmap_core::topic::{is_separator, split_including_separator};
use dynmap_core::Mapping;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::ResolutionError;

/// One node of the topic trie.
#[derive(Debug, Clone)]
pub struct TreeNode {
    children: HashMap<String, Vec<Arc<TreeNode>>>,
    mapping_node: bool,
    mapping: Option<Arc<Mapping>>,
    /// Absolute path of the parent, for diagnostics only.
    parent_path: Option<String>,
    absolute_path: String,
    depth: usize,
    level: String,
    tenant: Arc<str>,
}

impl TreeNode {
    fn root(tenant: Arc<str>) -> Self {
        Self {
            children: HashMap::new(),
            mapping_node: false,
            mapping: None,
            parent_path: None,
            absolute_path: String::new(),
            depth: 0,
            level: "root".to_string(),
            tenant,
        }
    }

    fn child_of(parent: &TreeNode, level: &str, mapping: Option<Arc<Mapping>>) -> Self {
        Self {
            children: HashMap::new(),
            mapping_node: mapping.is_some(),
            mapping,
            parent_path: Some(parent.absolute_path.clone()),
            absolute_path: format!("{}{}", parent.absolute_path, level),
            depth: parent.depth + 1,
            level: level.to_string(),
            tenant: parent.tenant.clone(),
        }
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.parent_path.as_deref()
    }

    /// Number of levels between this node and the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn is_mapping_node(&self) -> bool {
        self.mapping_node
    }

    pub fn mapping(&self) -> Option<&Arc<Mapping>> {
        self.mapping.as_ref()
    }

    /// Children registered under `token`, in insertion order.
    pub fn children(&self, token: &str) -> &[Arc<TreeNode>] {
        self.children.get(token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Child tokens in sorted order.
    pub fn tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<&str> = self.children.keys().map(String::as_str).collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    fn mapping_id(&self) -> Option<&str> {
        self.mapping.as_ref().map(|m| m.id.as_str())
    }
}

/// Result of removing a mapping below one node.
#[derive(Debug, Clone, Copy, Default)]
struct DeleteOutcome {
    removed: bool,
    /// Some node at or below the visited level still routes other mappings.
    branched: bool,
}

/// Concurrent topic trie of one tenant.
#[derive(Debug)]
pub struct TopicResolutionTree {
    tenant: Arc<str>,
    root: RwLock<Arc<TreeNode>>,
    write_lock: Mutex<()>,
}

impl TopicResolutionTree {
    pub fn new(tenant: impl Into<String>) -> Self {
        let tenant: Arc<str> = Arc::from(tenant.into());
        Self {
            root: RwLock::new(Arc::new(TreeNode::root(tenant.clone()))),
            tenant,
            write_lock: Mutex::new(()),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The currently committed tree.
    pub fn snapshot(&self) -> Arc<TreeNode> {
        self.root.read().clone()
    }

    /// All mappings whose topic pattern matches `topic`.
    ///
    /// Exact matches come first, then `+` matches, then `#` matches, each in
    /// insertion order. An unmatched topic yields an empty list.
    pub fn resolve(&self, topic: &str) -> Vec<Arc<Mapping>> {
        let levels = split_including_separator(topic);
        let mut matches = Vec::new();
        if !levels.is_empty() {
            let root = self.snapshot();
            resolve_level(&root, &levels, 0, &mut matches);
        }
        trace!(
            tenant = %self.tenant,
            topic = %topic,
            matches = matches.len(),
            "Resolved topic"
        );
        matches
    }

    /// Insert a terminal node for `mapping` at its routing topic.
    pub fn add_mapping(&self, mapping: Arc<Mapping>) -> Result<(), ResolutionError> {
        let _guard = self.write_lock.lock();
        let levels = split_including_separator(mapping.routing_topic());
        if levels.is_empty() {
            return Err(ResolutionError::EmptyTopic {
                mapping_id: mapping.id.clone(),
            });
        }

        let mut root = self.snapshot();
        insert_level(Arc::make_mut(&mut root), &levels, 0, &mapping)?;
        *self.root.write() = root;

        debug!(
            tenant = %self.tenant,
            mapping_id = %mapping.id,
            topic = %mapping.routing_topic(),
            "Added mapping to topic tree"
        );
        Ok(())
    }

    /// Remove the terminal node of `mapping`. Inner nodes left without children
    /// are pruned unless another mapping still routes through them.
    ///
    /// Returns `false` and leaves the tree untouched when the mapping is not
    /// registered at its topic.
    pub fn delete_mapping(&self, mapping: &Mapping) -> bool {
        let _guard = self.write_lock.lock();
        let levels = split_including_separator(mapping.routing_topic());
        let mut root = self.snapshot();
        if levels.is_empty() || !contains_terminal(&root, &levels, 0, &mapping.id) {
            debug!(
                tenant = %self.tenant,
                mapping_id = %mapping.id,
                "Mapping not present in topic tree"
            );
            return false;
        }

        let outcome = remove_level(Arc::make_mut(&mut root), &levels, 0, &mapping.id);
        if outcome.removed {
            *self.root.write() = root;
            info!(
                tenant = %self.tenant,
                mapping_id = %mapping.id,
                topic = %mapping.routing_topic(),
                shared_prefix = outcome.branched,
                "Deleted mapping from topic tree"
            );
        }
        outcome.removed
    }

    /// Whether a node exists at exactly `pattern`, matching tokens literally.
    pub fn contains_path(&self, pattern: &str) -> bool {
        let levels = split_including_separator(pattern);
        let root = self.snapshot();
        let mut frontier = vec![root];
        for level in &levels {
            frontier = frontier
                .iter()
                .flat_map(|n| n.children(level).iter().cloned())
                .collect();
            if frontier.is_empty() {
                return false;
            }
        }
        true
    }

    /// The registered mapping with `id`, if any.
    pub fn find(&self, id: &str) -> Option<Arc<Mapping>> {
        self.mappings().into_iter().find(|m| m.id == id)
    }

    /// Every registered mapping.
    pub fn mappings(&self) -> Vec<Arc<Mapping>> {
        let mut out = Vec::new();
        collect_mappings(&self.snapshot(), &mut out);
        out
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.snapshot().has_children()
    }

    /// One line per node: absolute path, followed by the mapping id for
    /// terminal nodes. Sorted for stable output.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        dump_node(&self.snapshot(), &mut lines);
        lines.sort();
        lines
    }
}

fn resolve_level(node: &TreeNode, levels: &[String], index: usize, out: &mut Vec<Arc<Mapping>>) {
    let Some(token) = levels.get(index) else {
        if let Some(mapping) = node.mapping.as_ref().filter(|_| node.mapping_node) {
            out.push(mapping.clone());
        }
        return;
    };

    for child in node.children(token) {
        resolve_level(child, levels, index + 1, out);
    }

    if token != TOPIC_WILDCARD_SINGLE && !is_separator(token) {
        for child in node.children(TOPIC_WILDCARD_SINGLE) {
            resolve_level(child, levels, index + 1, out);
        }
    }

    if token != TOPIC_WILDCARD_MULTI {
        for child in node.children(TOPIC_WILDCARD_MULTI) {
            if let Some(mapping) = child.mapping.as_ref().filter(|_| child.mapping_node) {
                out.push(mapping.clone());
            }
        }
    }
}

fn insert_level(
    node: &mut TreeNode,
    levels: &[String],
    index: usize,
    mapping: &Arc<Mapping>,
) -> Result<(), ResolutionError> {
    let token = &levels[index];
    let path = format!("{}{}", node.absolute_path, token);
    let existing = node.children(token);

    if index + 1 == levels.len() {
        if existing.iter().any(|c| !c.mapping_node) {
            return Err(ResolutionError::BlockedByInnerNode {
                mapping_id: mapping.id.clone(),
                path,
            });
        }
        if existing.iter().any(|c| c.mapping_id() == Some(mapping.id.as_str())) {
            return Err(ResolutionError::AlreadyRegistered {
                mapping_id: mapping.id.clone(),
                path,
            });
        }
        let child = TreeNode::child_of(node, token, Some(mapping.clone()));
        trace!(path = %child.absolute_path, depth = child.depth, "Adding terminal node");
        node.children
            .entry(token.clone())
            .or_default()
            .push(Arc::new(child));
        return Ok(());
    }

    if let Some(blocking) = existing.iter().find(|c| c.mapping_node) {
        return Err(ResolutionError::BlockedByMapping {
            mapping_id: mapping.id.clone(),
            path,
            blocking_id: blocking.mapping_id().unwrap_or_default().to_string(),
        });
    }
    if existing.len() > 1 {
        return Err(ResolutionError::AmbiguousInnerNode {
            mapping_id: mapping.id.clone(),
            path,
            count: existing.len(),
        });
    }

    if existing.is_empty() {
        let child = TreeNode::child_of(node, token, None);
        trace!(path = %child.absolute_path, depth = child.depth, "Adding inner node");
        node.children
            .insert(token.clone(), vec![Arc::new(child)]);
    }
    let Some(inner) = node.children.get_mut(token).and_then(|l| l.first_mut()) else {
        return Err(ResolutionError::AmbiguousInnerNode {
            mapping_id: mapping.id.clone(),
            path,
            count: 0,
        });
    };
    insert_level(Arc::make_mut(inner), levels, index + 1, mapping)
}

fn contains_terminal(node: &TreeNode, levels: &[String], index: usize, id: &str) -> bool {
    let children = node.children(&levels[index]);
    if index + 1 == levels.len() {
        children
            .iter()
            .any(|c| c.mapping_node && c.mapping_id() == Some(id))
    } else {
        children
            .iter()
            .filter(|c| !c.mapping_node)
            .any(|c| contains_terminal(c, levels, index + 1, id))
    }
}

fn remove_level(node: &mut TreeNode, levels: &[String], index: usize, id: &str) -> DeleteOutcome {
    let token = &levels[index];
    let Some(list) = node.children.get_mut(token) else {
        return DeleteOutcome::default();
    };

    let mut outcome = DeleteOutcome::default();
    if index + 1 == levels.len() {
        let before = list.len();
        list.retain(|c| !(c.mapping_node && c.mapping_id() == Some(id)));
        outcome.removed = list.len() != before;
        outcome.branched = !list.is_empty();
    } else {
        for child in list.iter_mut().filter(|c| !c.mapping_node) {
            let below = remove_level(Arc::make_mut(child), levels, index + 1, id);
            if below.removed {
                outcome = below;
                break;
            }
        }
        if outcome.removed && !outcome.branched {
            let pruned = prune_empty(list);
            if pruned > 0 {
                trace!(
                    path = %format!("{}{}", node.absolute_path, token),
                    pruned,
                    "Pruned empty inner node"
                );
            }
        }
        if list.iter().any(|c| c.has_children() || c.mapping_node) {
            outcome.branched = true;
        }
    }

    if list.is_empty() {
        node.children.remove(token);
    }
    if node.children.len() > 1 {
        outcome.branched = true;
    }
    outcome
}

/// Drop inner nodes without children. Returns how many were dropped.
fn prune_empty(list: &mut Vec<Arc<TreeNode>>) -> usize {
    let before = list.len();
    list.retain(|c| c.mapping_node || c.has_children());
    before - list.len()
}

fn collect_mappings(node: &TreeNode, out: &mut Vec<Arc<Mapping>>) {
    let mut tokens: Vec<&String> = node.children.keys().collect();
    tokens.sort_unstable();
    for token in tokens {
        for child in &node.children[token] {
            if let Some(mapping) = child.mapping.as_ref().filter(|_| child.mapping_node) {
                out.push(mapping.clone());
            }
            collect_mappings(child, out);
        }
    }
}

fn dump_node(node: &TreeNode, lines: &mut Vec<String>) {
    for list in node.children.values() {
        for child in list {
            match child.mapping_id() {
                Some(id) => lines.push(format!("{} -> {}", child.absolute_path, id)),
                None => lines.push(child.absolute_path.clone()),
            }
            dump_node(child, lines);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: &str, topic: &str) -> Arc<Mapping> {
        Arc::new(Mapping::new(id, topic).with_id(id))
    }

    fn ids(mappings: &[Arc<Mapping>]) -> Vec<&str> {
        mappings.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_resolve_exact() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "devices/42/temperature")).unwrap();
        assert_eq!(ids(&tree.resolve("devices/42/temperature")), vec!["m1"]);
        assert!(tree.resolve("devices/42").is_empty());
        assert!(tree.resolve("devices/43/temperature").is_empty());
        assert!(tree.resolve("").is_empty());
    }

    #[test]
    fn test_resolve_single_level_wildcard() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "devices/+/temperature")).unwrap();
        assert_eq!(ids(&tree.resolve("devices/42/temperature")), vec!["m1"]);
        assert!(tree.resolve("devices/42/43/temperature").is_empty());
    }

    #[test]
    fn test_single_level_wildcard_does_not_match_separator() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/+")).unwrap();
        assert_eq!(ids(&tree.resolve("a/b")), vec!["m1"]);
        assert!(tree.resolve("a//").is_empty());
    }

    #[test]
    fn test_duplicate_separators_stay_distinct() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/b")).unwrap();
        assert!(tree.resolve("a//b").is_empty());
    }

    #[test]
    fn test_resolve_multi_level_wildcard() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/#")).unwrap();
        assert_eq!(ids(&tree.resolve("a/x")), vec!["m1"]);
        assert_eq!(ids(&tree.resolve("a/x/y/z")), vec!["m1"]);
        assert!(tree.resolve("b/x").is_empty());
    }

    #[test]
    fn test_result_order_exact_single_multi() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("multi", "a/#")).unwrap();
        tree.add_mapping(mapping("single", "a/+")).unwrap();
        tree.add_mapping(mapping("exact", "a/b")).unwrap();
        tree.add_mapping(mapping("exact2", "a/b")).unwrap();
        assert_eq!(
            ids(&tree.resolve("a/b")),
            vec!["exact", "exact2", "single", "multi"]
        );
    }

    #[test]
    fn test_terminal_blocks_longer_topic() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/b")).unwrap();
        let err = tree.add_mapping(mapping("m2", "a/b/c")).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::BlockedByMapping { ref blocking_id, .. } if blocking_id == "m1"
        ));
        assert_eq!(tree.mapping_count(), 1);
    }

    #[test]
    fn test_inner_node_blocks_shorter_topic() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/b/c")).unwrap();
        let err = tree.add_mapping(mapping("m2", "a/b")).unwrap_err();
        assert!(matches!(err, ResolutionError::BlockedByInnerNode { .. }));
        assert_eq!(ids(&tree.resolve("a/b/c")), vec!["m1"]);
    }

    #[test]
    fn test_failed_insert_is_not_visible() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/b")).unwrap();
        let before = tree.dump();
        assert!(tree.add_mapping(mapping("m2", "a/b/c/d")).is_err());
        assert_eq!(tree.dump(), before);
        assert!(!tree.contains_path("a/b/c"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/b")).unwrap();
        assert!(matches!(
            tree.add_mapping(mapping("m1", "a/b")),
            Err(ResolutionError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let tree = TopicResolutionTree::new("t1");
        assert!(matches!(
            tree.add_mapping(mapping("m1", "")),
            Err(ResolutionError::EmptyTopic { .. })
        ));
    }

    #[test]
    fn test_delete_prunes_unshared_path() {
        let tree = TopicResolutionTree::new("t1");
        let m = mapping("m1", "a/b/c");
        tree.add_mapping(m.clone()).unwrap();
        assert!(tree.delete_mapping(&m));
        assert!(tree.is_empty());
        assert!(tree.dump().is_empty());
    }

    #[test]
    fn test_delete_keeps_shared_prefix() {
        let tree = TopicResolutionTree::new("t1");
        let c = mapping("c", "a/b/c");
        tree.add_mapping(c.clone()).unwrap();
        tree.add_mapping(mapping("d", "a/b/d")).unwrap();

        assert!(tree.delete_mapping(&c));
        assert_eq!(ids(&tree.resolve("a/b/d")), vec!["d"]);
        assert!(tree.resolve("a/b/c").is_empty());
        assert!(tree.contains_path("a/b"));
        assert!(!tree.contains_path("a/b/c"));
    }

    #[test]
    fn test_prune_empty_counts_only_removed_nodes() {
        let root = TreeNode::root(Arc::from("t1"));
        let terminal = Arc::new(TreeNode::child_of(&root, "b", Some(mapping("m1", "b"))));
        let mut routing = TreeNode::child_of(&root, "c", None);
        routing.children.insert("x".to_string(), vec![terminal.clone()]);

        let mut list = vec![terminal, Arc::new(routing)];
        assert_eq!(prune_empty(&mut list), 0);
        assert_eq!(list.len(), 2);

        list.push(Arc::new(TreeNode::child_of(&root, "a", None)));
        assert_eq!(prune_empty(&mut list), 1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_delete_twice_is_noop() {
        let tree = TopicResolutionTree::new("t1");
        let m = mapping("m1", "a/b");
        tree.add_mapping(m.clone()).unwrap();
        tree.add_mapping(mapping("m2", "a/c")).unwrap();
        assert!(tree.delete_mapping(&m));
        let after_first = tree.dump();
        assert!(!tree.delete_mapping(&m));
        assert_eq!(tree.dump(), after_first);
    }

    #[test]
    fn test_delete_only_matching_sibling() {
        let tree = TopicResolutionTree::new("t1");
        let first = mapping("first", "a/b");
        tree.add_mapping(first.clone()).unwrap();
        tree.add_mapping(mapping("second", "a/b")).unwrap();
        assert!(tree.delete_mapping(&first));
        assert_eq!(ids(&tree.resolve("a/b")), vec!["second"]);
    }

    #[test]
    fn test_node_metadata() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/+")).unwrap();
        let root = tree.snapshot();
        let a = &root.children("a")[0];
        assert_eq!(a.depth(), 1);
        assert_eq!(a.parent_path(), Some(""));
        assert!(!a.is_mapping_node());
        let sep = &a.children("/")[0];
        let plus = &sep.children("+")[0];
        assert_eq!(plus.absolute_path(), "a/+");
        assert_eq!(plus.parent_path(), Some("a/"));
        assert_eq!(plus.tenant(), "t1");
        assert_eq!(plus.mapping().unwrap().id, "m1");
    }

    #[test]
    fn test_find_and_dump() {
        let tree = TopicResolutionTree::new("t1");
        tree.add_mapping(mapping("m1", "a/b")).unwrap();
        assert_eq!(tree.find("m1").unwrap().mapping_topic, "a/b");
        assert!(tree.find("m2").is_none());
        assert_eq!(tree.dump(), vec!["a", "a/", "a/b -> m1"]);
    }
}
