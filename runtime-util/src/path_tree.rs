//! A `/`-segmented trie matching literal, single-wildcard (`*`) and
//! double-wildcard (`**`) path patterns, plus the `{name}` / `{name=*}` /
//! `{name=**}` template aliases.
//!
//! Serves both product-level resource matching and per-operation
//! resource+method matching (the caller prepends the method as the first
//! segment for the latter), per the spec's §4.4 rationale.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    DoubleWildcard = 0,
    Wildcard = 1,
    Literal = 2,
}

struct ParsedSegment<'a> {
    kind: SegmentKind<'a>,
    var_name: Option<&'a str>,
}

enum SegmentKind<'a> {
    Literal(&'a str),
    Wildcard,
    DoubleWildcard,
}

fn parse_segment(raw: &str) -> ParsedSegment<'_> {
    if raw == "*" {
        return ParsedSegment { kind: SegmentKind::Wildcard, var_name: None };
    }
    if raw == "**" {
        return ParsedSegment { kind: SegmentKind::DoubleWildcard, var_name: None };
    }
    if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        if let Some((name, pattern)) = inner.split_once('=') {
            return match pattern {
                "**" => ParsedSegment { kind: SegmentKind::DoubleWildcard, var_name: Some(name) },
                _ => ParsedSegment { kind: SegmentKind::Wildcard, var_name: Some(name) },
            };
        }
        return ParsedSegment { kind: SegmentKind::Wildcard, var_name: Some(inner) };
    }
    ParsedSegment { kind: SegmentKind::Literal(raw), var_name: None }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

struct Node<V> {
    literal_children: HashMap<String, Node<V>>,
    wildcard_child: Option<Box<Node<V>>>,
    double_wildcard_child: Option<Box<Node<V>>>,
    var_name: Option<String>,
    value: Option<V>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            literal_children: HashMap::new(),
            wildcard_child: None,
            double_wildcard_child: None,
            var_name: None,
            value: None,
        }
    }
}

/// A match result: the stored value plus any `{name}` captures, ordered
/// as encountered along the matched path.
pub type Captures = Vec<(String, String)>;

pub struct PathTree<V> {
    root: Node<V>,
}

impl<V> Default for PathTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PathTree<V> {
    pub fn new() -> Self {
        Self { root: Node::new() }
    }

    /// Inserts `value` at `path`, overwriting any existing value at the
    /// exact same pattern.
    pub fn insert(&mut self, path: &str, value: V) {
        let segments = split_segments(path);
        let mut node = &mut self.root;
        for raw in segments {
            let parsed = parse_segment(raw);
            node = match parsed.kind {
                SegmentKind::Literal(lit) => node
                    .literal_children
                    .entry(lit.to_string())
                    .or_insert_with(Node::new),
                SegmentKind::Wildcard => node.wildcard_child.get_or_insert_with(|| Box::new(Node::new())),
                SegmentKind::DoubleWildcard => {
                    node.double_wildcard_child.get_or_insert_with(|| Box::new(Node::new()))
                }
            };
            if let Some(name) = parsed.var_name {
                node.var_name = Some(name.to_string());
            }
        }
        node.value = Some(value);
    }

    /// Returns the value at the best match for `path`, or `None`.
    pub fn find(&self, path: &str) -> Option<&V> {
        self.find_and_extract(path).map(|(v, _)| v)
    }

    /// Like [`find`](Self::find), also returning captured template
    /// variables. A `{name=**}` capture is the `/`-joined remainder.
    pub fn find_and_extract(&self, path: &str) -> Option<(&V, Captures)> {
        let parts = split_segments(path);
        let mut candidates: Vec<(Vec<Kind>, &V, Captures)> = Vec::new();
        let mut kinds = Vec::new();
        let mut captures = Vec::new();
        collect_matches(&self.root, &parts, &mut kinds, &mut captures, &mut candidates);
        candidates
            .into_iter()
            .max_by(|a, b| (a.0.len(), &a.0).cmp(&(b.0.len(), &b.0)))
            .map(|(_, v, caps)| (v, caps))
    }

    /// Returns the deepest node along `path` that carries a value, and how
    /// many input segments were consumed to reach it.
    pub fn find_prefix(&self, path: &str) -> Option<(&V, usize)> {
        let parts = split_segments(path);
        let mut best: Option<(usize, &V)> = None;
        walk_prefix(&self.root, &parts, 0, &mut best);
        best
    }
}

fn collect_matches<'a, V>(
    node: &'a Node<V>,
    remaining: &[&str],
    kinds: &mut Vec<Kind>,
    captures: &mut Captures,
    out: &mut Vec<(Vec<Kind>, &'a V, Captures)>,
) {
    if remaining.is_empty() {
        if let Some(v) = &node.value {
            out.push((kinds.clone(), v, captures.clone()));
        }
        if let Some(child) = &node.double_wildcard_child {
            if let Some(v) = &child.value {
                kinds.push(Kind::DoubleWildcard);
                let pushed = push_capture(child, "", captures);
                out.push((kinds.clone(), v, captures.clone()));
                if pushed {
                    captures.pop();
                }
                kinds.pop();
            }
        }
        return;
    }

    let seg = remaining[0];
    let rest = &remaining[1..];

    if let Some(child) = node.literal_children.get(seg) {
        kinds.push(Kind::Literal);
        collect_matches(child, rest, kinds, captures, out);
        kinds.pop();
    }

    if let Some(child) = &node.wildcard_child {
        kinds.push(Kind::Wildcard);
        let pushed = push_capture(child, seg, captures);
        collect_matches(child, rest, kinds, captures, out);
        if pushed {
            captures.pop();
        }
        kinds.pop();
    }

    if let Some(child) = &node.double_wildcard_child {
        if let Some(v) = &child.value {
            kinds.push(Kind::DoubleWildcard);
            let joined = remaining.join("/");
            let pushed = push_capture(child, &joined, captures);
            out.push((kinds.clone(), v, captures.clone()));
            if pushed {
                captures.pop();
            }
            kinds.pop();
        }
    }
}

fn push_capture<V>(node: &Node<V>, value: &str, captures: &mut Captures) -> bool {
    match &node.var_name {
        Some(name) => {
            captures.push((name.clone(), value.to_string()));
            true
        }
        None => false,
    }
}

fn walk_prefix<'a, V>(node: &'a Node<V>, parts: &[&str], depth: usize, best: &mut Option<(usize, &'a V)>) {
    if let Some(v) = &node.value {
        if best.map(|(d, _)| depth > d).unwrap_or(true) {
            *best = Some((depth, v));
        }
    }
    if parts.is_empty() {
        return;
    }
    let seg = parts[0];
    let rest = &parts[1..];

    if let Some(child) = node.literal_children.get(seg) {
        walk_prefix(child, rest, depth + 1, best);
    }
    if let Some(child) = &node.wildcard_child {
        walk_prefix(child, rest, depth + 1, best);
    }
    if let Some(child) = &node.double_wildcard_child {
        if let Some(v) = &child.value {
            let total = depth + parts.len();
            if best.map(|(d, _)| total > d).unwrap_or(true) {
                *best = Some((total, v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_literal_round_trips() {
        let mut tree = PathTree::new();
        tree.insert("a/b/c", "leaf");
        assert_eq!(tree.find("a/b/c"), Some(&"leaf"));
    }

    #[test]
    fn best_match_prefers_literal_over_wildcard_over_double_wildcard() {
        let mut tree = PathTree::new();
        tree.insert("a", "a");
        tree.insert("a/*", "a-star");
        tree.insert("a/**", "a-doublestar");
        tree.insert("a/b", "a-b");
        tree.insert("a/b/c", "a-b-c");
        tree.insert("a/*/c", "a-star-c");

        assert_eq!(tree.find("a/b/c"), Some(&"a-b-c"));
        assert_eq!(tree.find("a/x/c"), Some(&"a-star-c"));
        assert_eq!(tree.find("a/x/x/x"), Some(&"a-doublestar"));
    }

    #[test]
    fn template_segments_alias_wildcards_and_capture() {
        let mut tree = PathTree::new();
        tree.insert("users/{id}/orders/{order=**}", "order-detail");
        let (value, captures) = tree.find_and_extract("users/42/orders/2024/11").unwrap();
        assert_eq!(*value, "order-detail");
        assert_eq!(
            captures,
            vec![
                ("id".to_string(), "42".to_string()),
                ("order".to_string(), "2024/11".to_string()),
            ]
        );
    }

    #[test]
    fn find_prefix_returns_deepest_match_and_consumed_length() {
        let mut tree = PathTree::new();
        tree.insert("a", "a");
        tree.insert("a/b", "a-b");
        let (value, consumed) = tree.find_prefix("a/b/c/d").unwrap();
        assert_eq!(*value, "a-b");
        assert_eq!(consumed, 2);
    }

    #[test]
    fn unmatched_path_returns_none() {
        let mut tree: PathTree<&str> = PathTree::new();
        tree.insert("a/b", "x");
        assert_eq!(tree.find("z/y"), None);
    }

    #[test]
    fn empty_segments_are_skipped_on_insert_and_lookup() {
        let mut tree = PathTree::new();
        tree.insert("//a//b/", "v");
        assert_eq!(tree.find("/a/b"), Some(&"v"));
    }
}
