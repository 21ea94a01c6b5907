//! Pattern index: an immutable trie over path segments.
//!
//! # Responsibilities
//! - Store registered routes and their payloads
//! - Answer single best match queries (`match_one`)
//! - Answer every-overlapping-match queries (`match_all`)
//!
//! # Design Decisions
//! - Built once per registration snapshot, never mutated afterwards
//! - Literal children live in a `BTreeMap` so walks are deterministic
//! - Duplicate (method, pattern) pairs replace the earlier payload in place
//! - In match-all a bare `/` covers every path and ranks like `/**`;
//!   match-one keeps it root-only

use std::collections::{BTreeMap, HashMap};

use crate::routing::pattern::{parse_pattern, split_path, Params, Segment, Specificity};

/// A route as registered by the caller.
#[derive(Debug, Clone)]
pub struct Route<T> {
    /// Method filter. Empty matches any method.
    pub method: String,
    pub pattern: String,
    pub payload: T,
}

impl<T> Route<T> {
    pub fn new(method: impl Into<String>, pattern: impl Into<String>, payload: T) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            pattern: pattern.into(),
            payload,
        }
    }

    /// A route that matches any method.
    pub fn any(pattern: impl Into<String>, payload: T) -> Self {
        Self::new("", pattern, payload)
    }
}

/// A stored route with its parsed form.
#[derive(Debug, Clone)]
pub struct RouteEntry<T> {
    pub method: String,
    pub pattern: String,
    pub segments: Vec<Segment>,
    pub specificity: Specificity,
    /// Ordering key among match-all results.
    pub cover: Specificity,
    pub payload: T,
}

impl<T> RouteEntry<T> {
    pub fn accepts_method(&self, method: &str) -> bool {
        self.method.is_empty() || self.method.eq_ignore_ascii_case(method)
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch<T> {
    /// Registration position of the matched route.
    pub index: usize,
    pub method: String,
    pub pattern: String,
    pub payload: T,
    pub params: Params,
}

#[derive(Debug, Default)]
struct Node {
    literals: BTreeMap<String, Node>,
    param: Option<Box<Node>>,
    wildcard: Option<Box<Node>>,
    /// Routes terminating at this node, in registration order.
    terminals: Vec<usize>,
}

/// Immutable routing table.
#[derive(Debug)]
pub struct RouteTable<T> {
    routes: Vec<RouteEntry<T>>,
    root: Node,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            root: Node::default(),
        }
    }
}

impl<T> RouteTable<T> {
    /// Build a table from a flat list of routes.
    pub fn new(routes: Vec<Route<T>>) -> Self {
        let mut entries: Vec<RouteEntry<T>> = Vec::with_capacity(routes.len());
        let mut positions: HashMap<(String, String), usize> = HashMap::new();

        for route in routes {
            let key = (route.method.clone(), route.pattern.clone());
            if let Some(&pos) = positions.get(&key) {
                tracing::debug!(method = %route.method, pattern = %route.pattern, "Replacing duplicate route");
                entries[pos].payload = route.payload;
                continue;
            }
            let segments = parse_pattern(&route.pattern);
            positions.insert(key, entries.len());
            entries.push(RouteEntry {
                specificity: Specificity::of(&segments),
                cover: Specificity::covering(&segments),
                method: route.method,
                pattern: route.pattern,
                segments,
                payload: route.payload,
            });
        }

        let mut root = Node::default();
        for (index, entry) in entries.iter().enumerate() {
            insert(&mut root, &entry.segments, index);
        }

        Self {
            routes: entries,
            root,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[RouteEntry<T>] {
        &self.routes
    }

    pub fn route(&self, index: usize) -> Option<&RouteEntry<T>> {
        self.routes.get(index)
    }

    /// Index of the most specific route for `method` and `path`.
    pub fn find_one(&self, method: &str, path: &str) -> Option<usize> {
        let segments = split_path(path);
        self.walk_one(&self.root, &segments, 0, method)
    }

    /// Indices of every route covering `path`, least specific first.
    pub fn find_all(&self, method: &str, path: &str) -> Vec<usize> {
        let segments = split_path(path);
        let mut found = Vec::new();
        collect(&self.root, &segments, 0, &mut found);
        if !segments.is_empty() {
            // Root routes cover every path.
            found.extend_from_slice(&self.root.terminals);
        }

        let mut found: Vec<usize> = found
            .into_iter()
            .filter(|&i| self.routes[i].accepts_method(method))
            .collect();
        found.sort_by(|&a, &b| {
            self.routes[a]
                .cover
                .cmp(&self.routes[b].cover)
                .then(a.cmp(&b))
        });
        found
    }

    fn walk_one(&self, node: &Node, path: &[&str], depth: usize, method: &str) -> Option<usize> {
        if depth == path.len() {
            if let Some(found) = self.pick(&node.terminals, method) {
                return Some(found);
            }
            return node
                .wildcard
                .as_ref()
                .and_then(|w| self.pick(&w.terminals, method));
        }

        if let Some(child) = node.literals.get(path[depth]) {
            if let Some(found) = self.walk_one(child, path, depth + 1, method) {
                return Some(found);
            }
        }
        if let Some(child) = &node.param {
            if let Some(found) = self.walk_one(child, path, depth + 1, method) {
                return Some(found);
            }
        }
        node.wildcard
            .as_ref()
            .and_then(|w| self.pick(&w.terminals, method))
    }

    /// Prefer an exact method filter over an any-method route at the same node.
    fn pick(&self, terminals: &[usize], method: &str) -> Option<usize> {
        terminals
            .iter()
            .copied()
            .find(|&i| {
                let route = &self.routes[i];
                !route.method.is_empty() && route.method.eq_ignore_ascii_case(method)
            })
            .or_else(|| {
                terminals
                    .iter()
                    .copied()
                    .find(|&i| self.routes[i].method.is_empty())
            })
    }
}

impl<T: Clone> RouteTable<T> {
    /// The single most specific match.
    pub fn match_one(&self, method: &str, path: &str) -> Option<RouteMatch<T>> {
        let index = self.find_one(method, path)?;
        Some(self.to_match(index, path))
    }

    /// Every match, ordered from least to most specific.
    pub fn match_all(&self, method: &str, path: &str) -> Vec<RouteMatch<T>> {
        self.find_all(method, path)
            .into_iter()
            .map(|index| self.to_match(index, path))
            .collect()
    }

    pub(crate) fn to_match(&self, index: usize, path: &str) -> RouteMatch<T> {
        let entry = &self.routes[index];
        RouteMatch {
            index,
            method: entry.method.clone(),
            pattern: entry.pattern.clone(),
            payload: entry.payload.clone(),
            params: Params::capture(&entry.segments, &split_path(path)),
        }
    }
}

fn insert(root: &mut Node, segments: &[Segment], index: usize) {
    let mut node = root;
    for segment in segments {
        node = match segment {
            Segment::Literal(value) => node.literals.entry(value.clone()).or_default(),
            Segment::Param(_) => node.param.get_or_insert_with(Box::default),
            Segment::Wildcard(_) => node.wildcard.get_or_insert_with(Box::default),
        };
    }
    node.terminals.push(index);
}

fn collect(node: &Node, path: &[&str], depth: usize, out: &mut Vec<usize>) {
    if let Some(wildcard) = &node.wildcard {
        out.extend_from_slice(&wildcard.terminals);
    }
    if depth == path.len() {
        out.extend_from_slice(&node.terminals);
        return;
    }
    if let Some(child) = node.literals.get(path[depth]) {
        collect(child, path, depth + 1, out);
    }
    if let Some(child) = &node.param {
        collect(child, path, depth + 1, out);
    }
}
