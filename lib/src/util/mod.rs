mod path_ext;

pub use path_ext::*;

use std::path::{Path, PathBuf, Component};

/// Lexically normalizes `path`: drops `.` components and resolves `..`
/// against preceding normal components. Leading `..` that cannot be
/// resolved are kept.
///
/// ```
/// use std::path::Path;
/// use sluice::util::normalize;
///
/// assert_eq!(normalize("a/./b/../c"), Path::new("a/c"));
/// assert_eq!(normalize("./partials/../header.html"), Path::new("header.html"));
/// assert_eq!(normalize("../a/b"), Path::new("../a/b"));
/// assert_eq!(normalize("/a/../../b"), Path::new("/b"));
/// ```
pub fn normalize<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut parts: Vec<Component<'_>> = vec![];
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => { parts.pop(); },
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {},
                _ => parts.push(component),
            },
            _ => parts.push(component),
        }
    }

    parts.iter().map(|c| c.as_os_str()).collect()
}

/// Absolute, lexically normalized form of `path` relative to the current
/// working directory. Does not touch the file system beyond reading the
/// working directory, so `path` need not exist.
pub fn absolute<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        return normalize(path);
    }

    match std::env::current_dir() {
        Ok(cwd) => normalize(cwd.join(path)),
        Err(_) => normalize(path),
    }
}

/// Returns `true` if `a` contains `b` or `b` contains `a`.
pub fn overlaps<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> bool {
    let (a, b) = (absolute(a), absolute(b));
    a.starts_with(&b) || b.starts_with(&a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_directories() {
        assert!(overlaps("site/src", "site/src/img"));
        assert!(overlaps("site/build/css", "site/build"));
        assert!(overlaps("site/./build", "site/build"));
        assert!(!overlaps("site/src", "site/build"));
        assert!(!overlaps("site/src", "site/srcs"));
    }
}
