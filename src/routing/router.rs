//! Route lookup over swappable snapshots.
//!
//! # Responsibilities
//! - Hold the current routing snapshot
//! - Replace it atomically on registration changes
//! - Serve lookups through the compiled matcher of the snapshot
//!
//! # Design Decisions
//! - Copy-on-write: `update` builds a new table and swaps it in with `ArcSwap`,
//!   readers never observe a partially built index
//! - The compiled matcher lives inside the snapshot, so swapping the snapshot
//!   invalidates it and a table/matcher pair can never disagree
//! - Reads are lock-free and may run fully in parallel

use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;

use crate::routing::compiler::{compile, CompiledDispatch};
use crate::routing::index::{Route, RouteMatch, RouteTable};

/// One immutable routing snapshot.
#[derive(Debug)]
pub struct RouteSnapshot<T> {
    table: RouteTable<T>,
    compiled: OnceLock<CompiledDispatch>,
}

impl<T> RouteSnapshot<T> {
    fn new(table: RouteTable<T>) -> Self {
        Self {
            table,
            compiled: OnceLock::new(),
        }
    }

    pub fn table(&self) -> &RouteTable<T> {
        &self.table
    }

    /// The compiled matcher for this snapshot, built on first use.
    pub fn compiled(&self) -> &CompiledDispatch {
        self.compiled.get_or_init(|| {
            let compiled = compile(&self.table);
            tracing::debug!(routes = compiled.len(), "Compiled dispatch table");
            compiled
        })
    }
}

impl<T: Clone> RouteSnapshot<T> {
    /// Best match through the compiled matcher.
    pub fn dispatch(&self, method: &str, path: &str) -> Option<RouteMatch<T>> {
        let (index, params) = self.compiled().match_one(method, path)?;
        let entry = self.table.route(index)?;
        Some(RouteMatch {
            index,
            method: entry.method.clone(),
            pattern: entry.pattern.clone(),
            payload: entry.payload.clone(),
            params,
        })
    }

    /// Every match through the compiled matcher, least specific first.
    pub fn dispatch_all(&self, method: &str, path: &str) -> Vec<RouteMatch<T>> {
        self.compiled()
            .match_all(method, path)
            .into_iter()
            .filter_map(|(index, params)| {
                let entry = self.table.route(index)?;
                Some(RouteMatch {
                    index,
                    method: entry.method.clone(),
                    pattern: entry.pattern.clone(),
                    payload: entry.payload.clone(),
                    params,
                })
            })
            .collect()
    }
}

/// A routing table that can be replaced at runtime.
#[derive(Debug)]
pub struct Router<T> {
    current: ArcSwap<RouteSnapshot<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteSnapshot::new(RouteTable::default())),
        }
    }
}

impl<T> Router<T> {
    pub fn new(routes: Vec<Route<T>>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteSnapshot::new(RouteTable::new(routes))),
        }
    }

    /// Atomically replace the table content. An empty list clears it.
    pub fn update(&self, routes: Vec<Route<T>>) {
        let table = RouteTable::new(routes);
        let count = table.len();
        self.current.store(Arc::new(RouteSnapshot::new(table)));
        tracing::debug!(routes = count, "Routing snapshot replaced");
    }

    /// The current snapshot. Holding it keeps a consistent view across lookups.
    pub fn snapshot(&self) -> Arc<RouteSnapshot<T>> {
        self.current.load_full()
    }
}

impl<T: Clone> Router<T> {
    pub fn match_one(&self, method: &str, path: &str) -> Option<RouteMatch<T>> {
        self.current.load().table().match_one(method, path)
    }

    pub fn match_all(&self, method: &str, path: &str) -> Vec<RouteMatch<T>> {
        self.current.load().table().match_all(method, path)
    }
}
