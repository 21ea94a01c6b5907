//! Rendered dispatcher source, compiled as part of this test crate.
//!
//! `fixtures/generated_dispatch.rs` is the exact output of `to_source` for
//! [`table`]. Including it as a module means a rendering change that stops
//! compiling fails the build, and the compiled functions are checked
//! against the live trie.

use route_cache::routing::{compile, Route, RouteTable};

#[path = "fixtures/generated_dispatch.rs"]
mod generated;

fn table() -> RouteTable<&'static str> {
    RouteTable::new(vec![
        Route::new("GET", "/a/b", "literal"),
        Route::any("/a/:x", "param"),
        Route::any("/a/**", "wildcard"),
        Route::any("/", "root"),
        Route::any("/files/**:path", "files"),
    ])
}

const CORPUS: &[(&str, &str)] = &[
    ("GET", "/a/b"),
    ("get", "/a/b"),
    ("POST", "/a/b"),
    ("GET", "/a/c"),
    ("GET", "/a"),
    ("GET", "/a/c/d?q=1"),
    ("GET", "/"),
    ("GET", ""),
    ("HEAD", "/files/x/y.txt"),
    ("GET", "/files"),
    ("GET", "/nothing/here"),
];

fn owned(params: Vec<(&'static str, String)>) -> Vec<(String, String)> {
    params.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn live(params: &route_cache::routing::Params) -> Vec<(String, String)> {
    params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn test_fixture_matches_rendered_source() {
    let rendered = compile(&table()).to_source();
    assert_eq!(rendered, include_str!("fixtures/generated_dispatch.rs"));
}

#[test]
fn test_generated_dispatch_agrees_with_trie() {
    let table = table();
    for &(method, path) in CORPUS {
        let expected = table
            .match_one(method, path)
            .map(|m| (m.index, live(&m.params)));
        let compiled = generated::dispatch(method, path).map(|(index, params)| (index, owned(params)));
        assert_eq!(compiled, expected, "dispatch {} {}", method, path);

        let live_all: Vec<_> = table
            .match_all(method, path)
            .into_iter()
            .map(|m| (m.index, live(&m.params)))
            .collect();
        let compiled_all: Vec<_> = generated::dispatch_all(method, path)
            .into_iter()
            .map(|(index, params)| (index, owned(params)))
            .collect();
        assert_eq!(compiled_all, live_all, "dispatch_all {} {}", method, path);
    }
}

#[test]
fn test_generated_root_covers_every_path_in_dispatch_all() {
    let all: Vec<usize> = generated::dispatch_all("GET", "/files/x")
        .into_iter()
        .map(|(index, _)| index)
        .collect();
    assert_eq!(all, vec![3, 4]);
    assert_eq!(generated::dispatch("GET", "/files/x").map(|(i, _)| i), Some(4));
    assert_eq!(generated::dispatch("GET", "/nothing").map(|(i, _)| i), None);
}
