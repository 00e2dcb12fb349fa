use std::fmt;
use std::sync::Arc;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{Result, Chainable};
use crate::util::normalize;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A base directory and the glob patterns, relative to it, that select
/// files. `**/` matches any number of directories; `*` never crosses a
/// separator. Brace alternatives (`*.{jpg,png}`) are expanded up front.
#[derive(Clone)]
pub struct SourcePattern {
    base: Arc<Path>,
    globs: Arc<[String]>,
    patterns: Arc<[Pattern]>,
}

impl SourcePattern {
    pub fn new<B, I, S>(base: B, globs: I) -> Result<Self>
        where B: AsRef<Path>, I: IntoIterator<Item = S>, S: AsRef<str>
    {
        let globs: Vec<String> = globs.into_iter()
            .flat_map(|g| expand_braces(g.as_ref()))
            .collect();

        if globs.is_empty() {
            return err!("a source pattern needs at least one glob",
                "base" => base.as_ref().display());
        }

        let patterns = globs.iter()
            .map(|glob| Pattern::new(glob).chain_with(|| error! {
                "invalid glob in source pattern",
                "glob" => glob,
                "base" => base.as_ref().display(),
            }))
            .collect::<Result<Vec<_>>>()?;

        Ok(SourcePattern {
            base: Arc::from(normalize(base.as_ref())),
            globs: globs.into(),
            patterns: patterns.into(),
        })
    }

    /// Convenience for a single glob.
    pub fn glob<B: AsRef<Path>>(base: B, glob: &str) -> Result<Self> {
        Self::new(base, [glob])
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The same pattern rooted at the canonical form of the base, as file
    /// system event paths are reported against it.
    pub fn canonicalize(&self) -> std::io::Result<Self> {
        Ok(SourcePattern {
            base: Arc::from(self.base.canonicalize()?),
            globs: self.globs.clone(),
            patterns: self.patterns.clone(),
        })
    }

    /// Whether `relative`, a path relative to the base, is selected.
    pub fn matches_relative<P: AsRef<Path>>(&self, relative: P) -> bool {
        let relative = relative.as_ref();
        self.patterns.iter().any(|p| p.matches_path_with(relative, MATCH_OPTIONS))
    }

    /// Whether `path`, a path under the base, is selected.
    pub fn matches<P: AsRef<Path>>(&self, path: P) -> bool {
        path.as_ref().strip_prefix(&self.base)
            .map_or(false, |relative| self.matches_relative(relative))
    }

    /// All selected files as base-relative paths, sorted. A missing base
    /// selects nothing.
    pub fn select(&self) -> Result<Vec<PathBuf>> {
        let mut selected: Vec<PathBuf> = self.files()?
            .into_iter()
            .filter(|relative| self.matches_relative(relative))
            .collect();

        selected.sort();
        Ok(selected)
    }

    /// Reads every file under the base, selected or not, into memory.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let files = self.files()?
            .into_par_iter()
            .map(|relative| {
                let path = self.base.join(&relative);
                let bytes = std::fs::read(&path).chain_with(|| error! {
                    "failed to read source file",
                    "path" => path.display(),
                })?;

                Ok((relative, Arc::<[u8]>::from(bytes)))
            })
            .collect::<Result<FxHashMap<_, _>>>()?;

        Ok(Snapshot { base: self.base.clone(), files: Arc::new(files) })
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.base.is_dir() {
            tracing::warn!(base = %self.base.display(), "source directory does not exist");
            return Ok(vec![]);
        }

        // Selection already runs on rayon workers, where jwalk's default
        // pool reports itself busy.
        let walker = jwalk::WalkDir::new(&*self.base)
            .parallelism(jwalk::Parallelism::Serial)
            .follow_links(true)
            .sort(true);

        let mut files = vec![];
        for entry in walker {
            let entry = entry.map_err(|e| error! {
                "failed to walk source directory",
                "base" => self.base.display(),
                "cause" => e,
            })?;

            if entry.file_type.is_file() {
                let path = entry.path();
                if let Ok(relative) = path.strip_prefix(&*self.base) {
                    files.push(relative.to_path_buf());
                }
            }
        }

        Ok(files)
    }
}

impl fmt::Debug for SourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourcePattern")
            .field("base", &self.base)
            .field("globs", &self.globs)
            .finish()
    }
}

impl fmt::Display for SourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.globs {
            [glob] => write!(f, "{}/{}", self.base.display(), glob),
            globs => write!(f, "{}/{{{}}}", self.base.display(), globs.join(",")),
        }
    }
}

/// An in-memory copy of every file under a source base, keyed by its
/// base-relative path.
#[derive(Clone)]
pub struct Snapshot {
    base: Arc<Path>,
    files: Arc<FxHashMap<PathBuf, Arc<[u8]>>>,
}

impl Snapshot {
    pub fn from_files<B, I, P, C>(base: B, files: I) -> Self
        where B: AsRef<Path>,
              I: IntoIterator<Item = (P, C)>,
              P: AsRef<Path>,
              C: AsRef<[u8]>,
    {
        let files = files.into_iter()
            .map(|(p, c)| (normalize(p), Arc::from(c.as_ref())))
            .collect();

        Snapshot { base: Arc::from(base.as_ref()), files: Arc::new(files) }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn get<P: AsRef<Path>>(&self, relative: P) -> Option<&[u8]> {
        self.files.get(&normalize(relative)).map(|b| &**b)
    }

    pub fn contains<P: AsRef<Path>>(&self, relative: P) -> bool {
        self.files.contains_key(&normalize(relative))
    }

    /// Whether any file lives under the directory `relative`.
    pub fn contains_dir<P: AsRef<Path>>(&self, relative: P) -> bool {
        let dir = normalize(relative);
        self.files.keys().any(|k| k.starts_with(&dir) && k != &dir)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("base", &self.base)
            .field("files", &self.files.len())
            .finish()
    }
}

/// Expands the first `{a,b}` group in `glob`, recursively.
///
/// ```
/// use sluice::source::expand_braces;
///
/// assert_eq!(expand_braces("*.{jpg,png}"), ["*.jpg", "*.png"]);
/// assert_eq!(expand_braces("{a,b}/*.{x,y}"), ["a/*.x", "a/*.y", "b/*.x", "b/*.y"]);
/// assert_eq!(expand_braces("**/*.svg"), ["**/*.svg"]);
/// ```
pub fn expand_braces(glob: &str) -> Vec<String> {
    let Some(open) = glob.find('{') else {
        return vec![glob.to_string()];
    };

    let Some(close) = glob[open..].find('}').map(|i| open + i) else {
        return vec![glob.to_string()];
    };

    let (head, tail) = (&glob[..open], &glob[(close + 1)..]);
    glob[(open + 1)..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{head}{alt}{tail}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, relative).unwrap();
    }

    #[test]
    fn single_star_does_not_descend() {
        let pages = SourcePattern::glob("src/pages", "*.html").unwrap();
        assert!(pages.matches_relative("index.html"));
        assert!(!pages.matches_relative("partials/header.html"));
        assert!(pages.matches("src/pages/about.html"));
        assert!(!pages.matches("src/styles/about.html"));

        let styles = SourcePattern::glob("src/styles", "**/*.scss").unwrap();
        assert!(styles.matches_relative("styles.scss"));
        assert!(styles.matches_relative("blocks/header/_header.scss"));
    }

    #[test]
    fn selection_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["b.jpg", "a.png", "nested/c.svg", "notes.txt", "nested/deep/d.jpeg"] {
            touch(dir.path(), file);
        }

        let images = SourcePattern::glob(dir.path(), "**/*.{jpg,jpeg,png,svg}").unwrap();
        let selected = images.select().unwrap();
        let expected: Vec<PathBuf> = ["a.png", "b.jpg", "nested/c.svg", "nested/deep/d.jpeg"]
            .into_iter()
            .map(PathBuf::from)
            .collect();

        assert_eq!(selected, expected);
    }

    #[test]
    fn selection_works_from_busy_rayon_workers() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["img/a.png", "img/icons/b.svg", "fonts/c.woff2", "fonts/sub/d.woff"] {
            touch(dir.path(), file);
        }

        let patterns = [
            SourcePattern::glob(dir.path().join("img"), "**/*.{png,svg}").unwrap(),
            SourcePattern::glob(dir.path().join("fonts"), "**/*.{woff,woff2}").unwrap(),
        ];

        let counts: Vec<usize> = patterns.par_iter()
            .map(|pattern| pattern.select().unwrap().len())
            .collect();

        assert_eq!(counts, [2, 2]);
    }

    #[test]
    fn missing_base_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fonts = SourcePattern::glob(dir.path().join("fonts"), "*.woff2").unwrap();
        assert!(fonts.select().unwrap().is_empty());
    }

    #[test]
    fn snapshot_holds_unselected_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "styles.scss");
        touch(dir.path(), "blocks/_a.scss");

        let styles = SourcePattern::glob(dir.path(), "styles.scss").unwrap();
        let snapshot = styles.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("./blocks/_a.scss"), Some(&b"blocks/_a.scss"[..]));
        assert!(snapshot.contains_dir("blocks"));
        assert!(!snapshot.contains_dir("blocks/_a.scss"));
    }
}
