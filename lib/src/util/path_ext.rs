use std::borrow::Cow;
use std::path::{Path, PathBuf};

pub trait PathExt: AsRef<Path> {
    fn without_extension(&self) -> Cow<'_, Path>;

    /// Inserts `suffix` between the file stem and the extension:
    /// `css/styles.css` + `.min` is `css/styles.min.css`.
    fn with_suffix(&self, suffix: &str) -> PathBuf;

    /// Path as a `/`-separated string, regardless of platform.
    fn to_slash_lossy(&self) -> String;
}

impl PathExt for Path {
    fn without_extension(&self) -> Cow<'_, Path> {
        match self.extension() {
            Some(_) => self.with_extension("").into(),
            None => self.into(),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let stem = self.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        let name = match self.extension() {
            Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
            None => format!("{stem}{suffix}"),
        };

        self.with_file_name(name)
    }

    fn to_slash_lossy(&self) -> String {
        let parts: Vec<_> = self.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();

        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_goes_before_the_extension() {
        assert_eq!(Path::new("css/styles.css").with_suffix(".min"), Path::new("css/styles.min.css"));
        assert_eq!(Path::new("LICENSE").with_suffix("-old"), Path::new("LICENSE-old"));
        assert_eq!(Path::new("a/b.tar.gz").without_extension(), Path::new("a/b.tar"));
        assert_eq!(Path::new("img/icons/a.svg").to_slash_lossy(), "img/icons/a.svg");
    }
}
