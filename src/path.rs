//! The small slice of path handling the mount registry actually needs.
//!
//! Full `libgen`-style splitting is an external collaborator per
//! `spec.md` §1; this module only provides the longest-prefix match the
//! mount registry performs and a component splitter the FAT/ext2 engines
//! use to walk a relative path one directory at a time.

pub const SEPARATOR: char = '/';

/// Splits `path` into its `/`-delimited components, skipping empty
/// components (so `"a//b/"` yields `["a", "b"]`).
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|c| !c.is_empty())
}

/// Splits `path` into `(parent_components_joined, final_component)`. Used
/// by engines to locate a file's parent directory before acting on the
/// file itself. Returns `None` if `path` has no final component (root).
pub fn split_last<'a>(path: &'a str) -> Option<(Vec<&'a str>, &'a str)> {
    let mut comps: Vec<&str> = components(path).collect();
    let last = comps.pop()?;
    Some((comps, last))
}

/// Returns the length, in bytes, of the longest of `candidates` that is a
/// prefix of `path` — the routing rule `spec.md` §4.2/§8.10 calls for.
/// Returns `None` if no candidate matches.
pub fn longest_prefix_index<'a>(path: &str, candidates: impl Iterator<Item = &'a str>) -> Option<(usize, &'a str)> {
    candidates
        .enumerate()
        .filter(|(_, mp)| path.starts_with(mp))
        .max_by_key(|(_, mp)| mp.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_components() {
        assert_eq!(components("/a/b/c").collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(components("a//b/").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn splits_last_component() {
        let (parent, last) = split_last("a/b/c").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(last, "c");
    }

    #[test]
    fn longest_prefix_wins() {
        let candidates = vec!["/", "/fat16/", "/fat16/hello/"];
        let (idx, mp) = longest_prefix_index("/fat16/hello/asdf.txt", candidates.into_iter()).unwrap();
        assert_eq!(mp, "/fat16/hello/");
        assert_eq!(idx, 2);
    }

    #[test]
    fn index_is_into_the_original_sequence_not_the_filtered_one() {
        // "/usb/" doesn't match at all, so a naive enumerate-after-filter
        // would report index 0 for "/fat/" here instead of its real index 1.
        let candidates = vec!["/usb/", "/fat/"];
        let (idx, mp) = longest_prefix_index("/fat/x", candidates.into_iter()).unwrap();
        assert_eq!(mp, "/fat/");
        assert_eq!(idx, 1);
    }
}
