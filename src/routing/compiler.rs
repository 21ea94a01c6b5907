//! Dispatch compiler.
//!
//! Turns a [`RouteTable`] snapshot into a flat, ordered list of segment tests
//! that can be evaluated without walking the trie, and renders the same list as
//! a self-contained Rust module for embedding into generated programs.
//!
//! # Design Decisions
//! - `compile` is a pure function of the snapshot; no hidden state
//! - Routes are pre-sorted by specificity so the first hit is the best hit
//! - Rendered source is byte-for-byte deterministic for a given snapshot

use std::fmt::Write;

use crate::routing::index::RouteTable;
use crate::routing::pattern::{
    covers_segments, matches_segments, split_path, Params, Segment, Specificity,
};

/// One route reduced to its matching instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRoute {
    /// Registration position in the source table.
    pub index: usize,
    pub method: String,
    pub pattern: String,
    pub segments: Vec<Segment>,
    specificity: Specificity,
    cover: Specificity,
}

impl CompiledRoute {
    /// A wildcard anywhere but the last position can never match.
    pub fn is_reachable(&self) -> bool {
        self.segments
            .iter()
            .position(|s| matches!(s, Segment::Wildcard(_)))
            .map_or(true, |pos| pos + 1 == self.segments.len())
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.method.is_empty() || self.method.eq_ignore_ascii_case(method)
    }
}

/// A directly callable matcher built from a routing snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledDispatch {
    /// Most specific first; exact method before any-method on ties.
    best_first: Vec<CompiledRoute>,
    /// Least specific first; registration order on ties.
    least_first: Vec<CompiledRoute>,
}

/// Compile a routing snapshot.
pub fn compile<T>(table: &RouteTable<T>) -> CompiledDispatch {
    let routes: Vec<CompiledRoute> = table
        .routes()
        .iter()
        .enumerate()
        .map(|(index, entry)| CompiledRoute {
            index,
            method: entry.method.clone(),
            pattern: entry.pattern.clone(),
            segments: entry.segments.clone(),
            specificity: entry.specificity.clone(),
            cover: entry.cover.clone(),
        })
        .collect();

    let mut best_first = routes.clone();
    best_first.sort_by(|a, b| {
        b.specificity
            .cmp(&a.specificity)
            .then(a.method.is_empty().cmp(&b.method.is_empty()))
            .then(a.index.cmp(&b.index))
    });

    let mut least_first = routes;
    least_first.sort_by(|a, b| a.cover.cmp(&b.cover).then(a.index.cmp(&b.index)));

    CompiledDispatch {
        best_first,
        least_first,
    }
}

impl CompiledDispatch {
    pub fn len(&self) -> usize {
        self.best_first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best_first.is_empty()
    }

    /// Index and params of the most specific route.
    pub fn match_one(&self, method: &str, path: &str) -> Option<(usize, Params)> {
        let segments = split_path(path);
        self.best_first
            .iter()
            .find(|r| r.accepts_method(method) && matches_segments(&r.segments, &segments))
            .map(|r| (r.index, Params::capture(&r.segments, &segments)))
    }

    /// Indices and params of every covering route, least specific first.
    pub fn match_all(&self, method: &str, path: &str) -> Vec<(usize, Params)> {
        let segments = split_path(path);
        self.least_first
            .iter()
            .filter(|r| r.accepts_method(method) && covers_segments(&r.segments, &segments))
            .map(|r| (r.index, Params::capture(&r.segments, &segments)))
            .collect()
    }

    /// Render the matcher as a standalone Rust module.
    ///
    /// The module exposes `dispatch(method, path)` and `dispatch_all(method, path)`
    /// returning route indices with captured params.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        out.push_str("// Generated route dispatcher. Do not edit.\n");
        out.push_str("#![allow(dead_code, unused_variables, clippy::all)]\n\n");
        out.push_str("pub type Params = Vec<(&'static str, String)>;\n\n");
        out.push_str("fn split(path: &str) -> Vec<&str> {\n");
        out.push_str("    let path = path.split(['?', '#']).next().unwrap_or_default();\n");
        out.push_str("    path.split('/').filter(|s| !s.is_empty()).collect()\n");
        out.push_str("}\n\n");
        out.push_str("fn method_is(method: &str, expected: &str) -> bool {\n");
        out.push_str("    method.eq_ignore_ascii_case(expected)\n");
        out.push_str("}\n\n");

        out.push_str("pub fn dispatch(method: &str, path: &str) -> Option<(usize, Params)> {\n");
        out.push_str("    let s = split(path);\n");
        for route in &self.best_first {
            render_route(&mut out, route, false, |index, params| {
                format!("return Some(({}, {}));", index, params)
            });
        }
        out.push_str("    None\n}\n\n");

        out.push_str("pub fn dispatch_all(method: &str, path: &str) -> Vec<(usize, Params)> {\n");
        out.push_str("    let s = split(path);\n");
        out.push_str("    let mut out = Vec::new();\n");
        for route in &self.least_first {
            render_route(&mut out, route, true, |index, params| {
                format!("out.push(({}, {}));", index, params)
            });
        }
        out.push_str("    out\n}\n");
        out
    }
}

/// `covering` renders match-all semantics, where a bare `/` matches any path.
fn render_route(
    out: &mut String,
    route: &CompiledRoute,
    covering: bool,
    emit: impl Fn(usize, &str) -> String,
) {
    let label = if route.method.is_empty() {
        route.pattern.clone()
    } else {
        format!("{} {}", route.method, route.pattern)
    };
    if !route.is_reachable() {
        let _ = writeln!(out, "    // {} (unreachable)", label);
        return;
    }

    let mut conditions = Vec::new();
    if !route.method.is_empty() {
        conditions.push(format!("method_is(method, {:?})", route.method));
    }
    let mut params = Vec::new();
    let mut open_ended = false;
    for (i, segment) in route.segments.iter().enumerate() {
        match segment {
            Segment::Literal(value) => conditions.push(format!("s[{}] == {:?}", i, value)),
            Segment::Param(name) => params.push(format!("({:?}, s[{}].to_string())", name, i)),
            Segment::Wildcard(name) => {
                let name = name.as_deref().unwrap_or(crate::routing::pattern::WILDCARD_CAPTURE);
                params.push(format!("({:?}, s[{}..].join(\"/\"))", name, i));
                open_ended = true;
            }
        }
    }
    let fixed = if open_ended {
        route.segments.len() - 1
    } else {
        route.segments.len()
    };
    let length_check = if (open_ended || covering) && fixed == 0 {
        "true".to_string()
    } else if open_ended {
        format!("s.len() >= {}", fixed)
    } else {
        format!("s.len() == {}", fixed)
    };
    // The length check must run before any indexing.
    conditions.insert(usize::from(!route.method.is_empty()), length_check);

    let params = if params.is_empty() {
        "Vec::new()".to_string()
    } else {
        format!("vec![{}]", params.join(", "))
    };
    let _ = writeln!(out, "    // {}", label);
    let _ = writeln!(out, "    if {} {{", conditions.join(" && "));
    let _ = writeln!(out, "        {}", emit(route.index, &params));
    out.push_str("    }\n");
}
