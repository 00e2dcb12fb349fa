use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::util::{normalize, PathExt};

/// The one message pushed to browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reload {
    /// Changed files as URL paths under the served root.
    pub paths: Vec<String>,
    /// Reload the page. When `false`, every path is a stylesheet and the
    /// client swaps stylesheets in place.
    pub full: bool,
}

impl Reload {
    pub fn full() -> Self {
        Reload { paths: vec![], full: true }
    }

    /// The reload for files changed under `root`, the directory being
    /// served. Paths outside `root` are reported as they are.
    pub fn from_paths<R: AsRef<Path>>(root: R, changed: &[PathBuf]) -> Self {
        let root = normalize(root);
        let paths = changed.iter()
            .map(|path| match normalize(path).strip_prefix(&root) {
                Ok(relative) => format!("/{}", relative.to_slash_lossy()),
                Err(_) => path.to_slash_lossy(),
            })
            .collect();

        let styles_only = !changed.is_empty()
            && changed.iter().all(|p| p.extension().map_or(false, |e| e == "css"));

        Reload { paths, full: !styles_only }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stylesheets_swap_in_place() {
        let css = Reload::from_paths("build", &["build/css/styles.min.css".into()]);
        assert_eq!(css, Reload { paths: vec!["/css/styles.min.css".into()], full: false });

        let mixed = Reload::from_paths("./build", &["build/css/a.css".into(), "build/js/script.js".into()]);
        assert_eq!(mixed.paths, ["/css/a.css", "/js/script.js"]);
        assert!(mixed.full);

        assert!(Reload::from_paths("build", &[]).full);
        assert_eq!(Reload::from_paths("build", &["elsewhere/a.css".into()]).paths, ["elsewhere/a.css"]);
    }
}
