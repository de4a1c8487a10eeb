//! Patch builder: turns change sets and legacy descriptors into unified
//! diffs, plus small helpers for reading diffs back.

mod builder;
mod headers;
mod shadow;

pub use builder::PatchBuilder;

use patchline_common::fingerprint_file;
use std::collections::BTreeMap;
use std::path::Path;

/// Repository-relative paths named in a diff's headers, in first-seen order.
/// Paths git quoted (non-ASCII bytes, quotes, control characters) are
/// unquoted.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        let path = path.trim_end_matches(['\r', '\t']).trim();
        if !path.is_empty() && !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    };
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some((left, right)) = split_git_header(rest) {
                push(left.as_str());
                push(right.as_str());
            }
        } else if let Some(rest) = line.strip_prefix("--- ") {
            if let Some(path) = side_path(rest, "a/") {
                push(path.as_str());
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(path) = side_path(rest, "b/") {
                push(path.as_str());
            }
        }
    }
    paths
}

/// Both paths of a `diff --git` line, either side possibly quoted.
fn split_git_header(rest: &str) -> Option<(String, String)> {
    let (left, tail) = if rest.starts_with('"') {
        let (left, tail) = unquote(rest)?;
        (left, tail.strip_prefix(' ')?)
    } else {
        let at = rest.find(" \"b/").or_else(|| rest.find(" b/"))?;
        (rest[..at].to_string(), &rest[at + 1..])
    };
    let right = side_path(tail, "b/")?;
    Some((left.strip_prefix("a/")?.to_string(), right))
}

/// A `---`/`+++` path without its side prefix. `/dev/null` yields `None`.
fn side_path(raw: &str, prefix: &str) -> Option<String> {
    let path = if raw.starts_with('"') {
        unquote(raw)?.0
    } else {
        raw.to_string()
    };
    path.strip_prefix(prefix).map(str::to_string)
}

/// Undo git's C-style path quoting. Returns the path and whatever follows
/// the closing quote.
fn unquote(quoted: &str) -> Option<(String, &str)> {
    let body = quoted.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let path = String::from_utf8_lossy(&out).into_owned();
                return Some((path, &body[i + 1..]));
            }
            b'\\' => {
                let escaped = *bytes.get(i + 1)?;
                if escaped.is_ascii_digit() {
                    // Three octal digits encode one raw byte.
                    let digits = bytes.get(i + 1..i + 4)?;
                    let mut value: u32 = 0;
                    for digit in digits {
                        if !(b'0'..=b'7').contains(digit) {
                            return None;
                        }
                        value = value * 8 + u32::from(digit - b'0');
                    }
                    out.push(u8::try_from(value).ok()?);
                    i += 4;
                    continue;
                }
                out.push(match escaped {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b't' => b'\t',
                    b'n' => b'\n',
                    b'v' => 0x0b,
                    b'f' => 0x0c,
                    b'r' => b'\r',
                    other => other,
                });
                i += 2;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    None
}

/// Current fingerprints of the given paths under `root`. Paths that no
/// longer exist are left out.
pub fn fingerprints_for(root: &Path, paths: &[String]) -> BTreeMap<String, String> {
    paths
        .iter()
        .filter_map(|path| {
            fingerprint_file(&root.join(path))
                .ok()
                .map(|sha| (path.clone(), sha))
        })
        .collect()
}
