// Generated route dispatcher. Do not edit.
#![allow(dead_code, unused_variables, clippy::all)]

pub type Params = Vec<(&'static str, String)>;

fn split(path: &str) -> Vec<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn method_is(method: &str, expected: &str) -> bool {
    method.eq_ignore_ascii_case(expected)
}

pub fn dispatch(method: &str, path: &str) -> Option<(usize, Params)> {
    let s = split(path);
    // /
    if s.len() == 0 {
        return Some((3, Vec::new()));
    }
    // GET /a/b
    if method_is(method, "GET") && s.len() == 2 && s[0] == "a" && s[1] == "b" {
        return Some((0, Vec::new()));
    }
    // /a/:x
    if s.len() == 2 && s[0] == "a" {
        return Some((1, vec![("x", s[1].to_string())]));
    }
    // /a/**
    if s.len() >= 1 && s[0] == "a" {
        return Some((2, vec![("_", s[1..].join("/"))]));
    }
    // /files/**:path
    if s.len() >= 1 && s[0] == "files" {
        return Some((4, vec![("path", s[1..].join("/"))]));
    }
    None
}

pub fn dispatch_all(method: &str, path: &str) -> Vec<(usize, Params)> {
    let s = split(path);
    let mut out = Vec::new();
    // /
    if true {
        out.push((3, Vec::new()));
    }
    // /a/**
    if s.len() >= 1 && s[0] == "a" {
        out.push((2, vec![("_", s[1..].join("/"))]));
    }
    // /files/**:path
    if s.len() >= 1 && s[0] == "files" {
        out.push((4, vec![("path", s[1..].join("/"))]));
    }
    // /a/:x
    if s.len() == 2 && s[0] == "a" {
        out.push((1, vec![("x", s[1].to_string())]));
    }
    // GET /a/b
    if method_is(method, "GET") && s.len() == 2 && s[0] == "a" && s[1] == "b" {
        out.push((0, Vec::new()));
    }
    out
}
