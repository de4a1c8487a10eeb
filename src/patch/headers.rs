//! Header normalization for diffs produced outside the repository.
//!
//! `git diff --no-index` names files by the paths it was given, so a diff
//! against a scratch copy leaks the scratch location into `diff --git`,
//! `---` and `+++` lines. These helpers strip those prefixes back to
//! repository-relative `a/` and `b/` paths.

const SIDES: [&str; 2] = ["a", "b"];

/// Rewrite header lines of `raw`, removing every `roots` prefix that follows
/// an `a/` or `b/` marker. Hunk bodies are left untouched.
pub(crate) fn relativize_headers(raw: &str, roots: &[String]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_header = false;
    for line in raw.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            in_header = true;
        } else if line.starts_with("@@") || line.starts_with("GIT binary patch") {
            in_header = false;
        }

        if in_header && is_path_header(line) {
            out.push_str(&rewrite_line(line, roots));
        } else {
            out.push_str(line);
        }
    }
    out
}

fn is_path_header(line: &str) -> bool {
    line.starts_with("diff --git ") || line.starts_with("--- ") || line.starts_with("+++ ")
}

fn rewrite_line(line: &str, roots: &[String]) -> String {
    let mut line = line.to_string();
    for root in roots.iter().filter(|r| !r.is_empty()) {
        for side in SIDES {
            line = line.replace(&format!("{side}//{root}/"), &format!("{side}/"));
            line = line.replace(&format!("{side}/{root}/"), &format!("{side}/"));
        }
    }
    for side in SIDES {
        line = line.replace(&format!("{side}/./"), &format!("{side}/"));
    }
    line
}
