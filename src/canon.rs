//! Path canonicalization for hashing purposes.
//!
//! Paths arrive from the frontend with whatever separators the host platform
//! (or the user's build scripts) produced.  Signatures and the stale-output
//! tables key on paths, so two spellings of the same file must hash alike.

/// Canonicalize separators in place: every backslash becomes a forward slash
/// and runs of slashes collapse to one.
pub fn canon_separators_fast(path: &mut String) {
    if !path.contains('\\') && !path.contains("//") {
        return;
    }
    let mut out = String::with_capacity(path.len());
    let mut last_sep = false;
    for c in path.chars() {
        let is_sep = c == '/' || c == '\\';
        if is_sep {
            if !last_sep {
                out.push('/');
            }
        } else {
            out.push(c);
        }
        last_sep = is_sep;
    }
    *path = out;
}

#[must_use = "this method returns the canonicalized version; if possible, prefer `canon_separators_fast`"]
pub fn canon_separators(path: impl Into<String>) -> String {
    let mut path = path.into();
    canon_separators_fast(&mut path);
    path
}
