//! Dataset path algebra.
//!
//! Datasets are `/`-delimited paths (`pool/a/b`). Retention scope, exclusion
//! lists and target re-rooting all reduce to the string operations here.

use std::fmt;

/// An immutable `(dataset, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snapshot {
    pub dataset: String,
    pub name: String,
}

impl Snapshot {
    pub fn new(dataset: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.name)
    }
}

/// `true` if `child` is `parent` or lies beneath it.
pub fn is_child(child: &str, parent: &str) -> bool {
    if parent.is_empty() {
        return true;
    }
    child == parent
        || (child.len() > parent.len()
            && child.starts_with(parent)
            && child.as_bytes()[parent.len()] == b'/')
}

/// `true` if `dataset` is in the tree rooted at `root`.
///
/// Non-recursive trees contain only the root. Recursive trees contain every
/// descendant that is not beneath one of the `exclude` entries.
pub fn belongs_to_tree(dataset: &str, root: &str, recursive: bool, exclude: &[String]) -> bool {
    if recursive {
        is_child(dataset, root) && !exclude.iter().any(|e| is_child(dataset, e))
    } else {
        dataset == root
    }
}

/// Path of `dataset` relative to `base` (`""` when they are equal).
///
/// Returns `None` when `dataset` is not beneath `base`.
pub fn relpath<'a>(dataset: &'a str, base: &str) -> Option<&'a str> {
    if base.is_empty() {
        return Some(dataset);
    }
    if dataset == base {
        return Some("");
    }
    if is_child(dataset, base) {
        Some(&dataset[base.len() + 1..])
    } else {
        None
    }
}

/// Join a relative path onto a dataset.
pub fn join(dataset: &str, rel: &str) -> String {
    if rel.is_empty() {
        dataset.to_string()
    } else if dataset.is_empty() {
        rel.to_string()
    } else {
        format!("{dataset}/{rel}")
    }
}

/// Longest common dataset prefix (segment-wise).
pub fn common_base<S: AsRef<str>>(datasets: &[S]) -> String {
    let mut iter = datasets.iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let mut common: Vec<&str> = first.as_ref().split('/').collect();
    for dataset in iter {
        let segments: Vec<&str> = dataset.as_ref().split('/').collect();
        let shared = common
            .iter()
            .zip(segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
    }
    common.join("/")
}

/// Re-root `src_dataset` from the source scope onto `target`.
///
/// A single source dataset maps onto `target` itself. Several source datasets
/// map onto `target` relative to their common base, so `pool/a` and `pool/b`
/// replicated into `backup` land at `backup/a` and `backup/b`.
pub fn target_dataset<S: AsRef<str>>(source_datasets: &[S], target: &str, src_dataset: &str) -> Option<String> {
    let base = if source_datasets.len() == 1 {
        source_datasets[0].as_ref().to_string()
    } else {
        common_base(source_datasets)
    };
    relpath(src_dataset, &base).map(|rel| join(target, rel))
}

/// Inverse of [`target_dataset`].
pub fn source_dataset<S: AsRef<str>>(source_datasets: &[S], target: &str, dst_dataset: &str) -> Option<String> {
    let base = if source_datasets.len() == 1 {
        source_datasets[0].as_ref().to_string()
    } else {
        common_base(source_datasets)
    };
    relpath(dst_dataset, target).map(|rel| join(&base, rel))
}
