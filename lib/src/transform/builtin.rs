use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::asset::Asset;
use crate::util::PathExt;
use crate::transform::{Context, Transform, TransformError};

/// Passes assets through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        Ok(vec![asset.clone()])
    }
}

#[derive(Debug, Clone)]
enum Renaming {
    FileName(String),
    Suffix(String),
    Extension(String),
}

/// Changes an asset's path. With [`Rename::keep_original()`] the original
/// is emitted too, ahead of the renamed copy.
#[derive(Debug, Clone)]
pub struct Rename {
    renaming: Renaming,
    keep_original: bool,
}

impl Rename {
    /// Replaces the file name, keeping the directory.
    pub fn to<S: Into<String>>(file_name: S) -> Self {
        Rename { renaming: Renaming::FileName(file_name.into()), keep_original: false }
    }

    /// Inserts `suffix` before the extension: `.min` turns `a.js` into `a.min.js`.
    pub fn suffix<S: Into<String>>(suffix: S) -> Self {
        Rename { renaming: Renaming::Suffix(suffix.into()), keep_original: false }
    }

    pub fn extension<S: Into<String>>(ext: S) -> Self {
        Rename { renaming: Renaming::Extension(ext.into()), keep_original: false }
    }

    pub fn keep_original(mut self) -> Self {
        self.keep_original = true;
        self
    }

    pub fn rename(&self, path: &Path) -> PathBuf {
        match &self.renaming {
            Renaming::FileName(name) => path.with_file_name(name),
            Renaming::Suffix(suffix) => path.with_suffix(suffix),
            Renaming::Extension(ext) => path.with_extension(ext),
        }
    }
}

impl Transform for Rename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let renamed = asset.with_path(self.rename(asset.path()));
        match self.keep_original {
            true => Ok(vec![asset.clone(), renamed]),
            false => Ok(vec![renamed]),
        }
    }
}

static HTML_INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@@include\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex")
});

static RIGGER_INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*//=[ \t]*(\S+)[ \t]*$").expect("valid regex")
});

const MAX_INCLUDE_DEPTH: usize = 16;

/// Splices the files named by include directives into the asset.
///
/// Two syntaxes are understood: `@@include('partials/header.html')` for
/// markup and rigger-style `//= vendor/jquery.js` lines for scripts. Paths
/// resolve against the including file first, then the source base;
/// included files may include others.
#[derive(Debug, Clone)]
pub struct Include {
    directive: &'static Lazy<Regex>,
    marker: &'static str,
}

impl Include {
    pub fn html() -> Self {
        Include { directive: &HTML_INCLUDE, marker: "@@include" }
    }

    pub fn rigger() -> Self {
        Include { directive: &RIGGER_INCLUDE, marker: "//=" }
    }

    fn expand(
        &self,
        path: &Path,
        text: &str,
        cx: &Context,
        stack: &mut Vec<PathBuf>,
    ) -> Result<String, TransformError> {
        if memchr::memmem::find(text.as_bytes(), self.marker.as_bytes()).is_none() {
            return Ok(text.to_string());
        }

        if stack.len() > MAX_INCLUDE_DEPTH {
            return Err(TransformError::new(self.name(), path, "includes nest too deeply"));
        }

        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for captures in self.directive.captures_iter(text) {
            let (directive, target) = match (captures.get(0), captures.get(1)) {
                (Some(directive), Some(target)) => (directive, target.as_str()),
                _ => continue,
            };

            let resolved = cx.resolve(path, target).ok_or_else(|| {
                TransformError::new(self.name(), path, format!("included file `{target}` not found"))
            })?;

            if stack.contains(&resolved) {
                let cycle = stack.iter()
                    .chain(Some(&resolved))
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ");

                return Err(TransformError::new(self.name(), path, format!("include cycle: {cycle}")));
            }

            let bytes = cx.read(&resolved).unwrap_or_default();
            let included = std::str::from_utf8(bytes).map_err(|_| {
                TransformError::new(self.name(), path, format!("included file `{target}` is not UTF-8"))
            })?;

            stack.push(resolved.clone());
            let expanded = self.expand(&resolved, included, cx, stack)?;
            stack.pop();

            output.push_str(&text[last..directive.start()]);
            output.push_str(expanded.trim_end_matches('\n'));
            last = directive.end();
        }

        output.push_str(&text[last..]);
        Ok(output)
    }
}

impl Transform for Include {
    fn name(&self) -> &'static str {
        "include"
    }

    fn apply(&self, asset: &Asset, cx: &Context) -> Result<Vec<Asset>, TransformError> {
        let text = asset.text(self.name())?;
        let mut stack = vec![asset.path().to_path_buf()];
        let expanded = self.expand(asset.path(), text, cx, &mut stack)?;
        Ok(vec![asset.with_content(expanded)])
    }

    fn needs_sources(&self) -> bool {
        true
    }
}

/// Markup clean-up for production output: strips trailing whitespace,
/// collapses runs of blank lines into one and ends the file with a single
/// newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tidy;

impl Tidy {
    pub fn tidy(text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        let mut blank_run = 0;
        for line in text.trim_start_matches(['\n', '\r']).lines() {
            let line = line.trim_end();
            if line.is_empty() {
                blank_run += 1;
                if blank_run > 1 {
                    continue;
                }
            } else {
                blank_run = 0;
            }

            output.push_str(line);
            output.push('\n');
        }

        while output.ends_with("\n\n") {
            output.pop();
        }

        output
    }
}

impl Transform for Tidy {
    fn name(&self) -> &'static str {
        "tidy"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let text = asset.text(self.name())?;
        Ok(vec![asset.with_content(Tidy::tidy(text))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Content;
    use crate::source::Snapshot;

    fn text(asset: &Asset) -> &str {
        asset.content().as_text().unwrap()
    }

    #[test]
    fn rename_fans_out_when_keeping_the_original() {
        let asset = Asset::new("js/script.js", "let a = 1;");
        let out = Rename::suffix(".min").keep_original().apply(&asset, &Context::empty()).unwrap();
        let paths: Vec<_> = out.iter().map(|a| a.path()).collect();
        assert_eq!(paths, [Path::new("js/script.js"), Path::new("js/script.min.js")]);

        let out = Rename::to("styles.min.css").apply(&asset, &Context::empty()).unwrap();
        assert_eq!(out[0].path(), Path::new("js/styles.min.css"));

        let out = Rename::extension("webp").apply(&asset, &Context::empty()).unwrap();
        assert_eq!(out[0].path(), Path::new("js/script.webp"));
    }

    #[test]
    fn html_includes_resolve_recursively() {
        let cx = Context::with_sources(Snapshot::from_files("src/pages", [
            ("partials/header.html", "<header>@@include(\"nav.html\")</header>\n"),
            ("partials/nav.html", "<nav></nav>\n"),
        ]));

        let page = Asset::new("index.html", "<body>\n  @@include('partials/header.html')\n</body>\n");
        let out = Include::html().apply(&page, &cx).unwrap();
        assert_eq!(text(&out[0]), "<body>\n  <header><nav></nav></header>\n</body>\n");
    }

    #[test]
    fn include_cycles_and_missing_files_are_errors() {
        let cx = Context::with_sources(Snapshot::from_files("src/pages", [
            ("a.html", "@@include('b.html')"),
            ("b.html", "@@include('a.html')"),
        ]));

        let error = Include::html().apply(&Asset::new("a.html", "@@include('b.html')"), &cx).unwrap_err();
        assert_eq!(error.stage, "include");
        assert!(error.cause.contains("a.html -> b.html -> a.html"), "{error}");

        let error = Include::html().apply(&Asset::new("c.html", "@@include('d.html')"), &cx).unwrap_err();
        assert!(error.cause.contains("`d.html` not found"));
    }

    #[test]
    fn rigger_lines_pull_in_scripts() {
        let cx = Context::with_sources(Snapshot::from_files("src/js", [
            ("vendor/lib.js", "window.lib = {};\n"),
        ]));

        let script = Asset::new("script.js", "//= vendor/lib.js\n\nlib.go();\n");
        let out = Include::rigger().apply(&script, &cx).unwrap();
        assert_eq!(text(&out[0]), "window.lib = {};\n\nlib.go();\n");
    }

    #[test]
    fn binary_input_is_rejected() {
        let image = Asset::new("logo.png", Content::Binary(vec![0x89, 0x50].into()));
        let error = Include::html().apply(&image, &Context::empty()).unwrap_err();
        assert_eq!(error.source_path, Path::new("logo.png"));
    }

    #[test]
    fn tidy_normalizes_whitespace() {
        let input = "\n<html>  \n\n\n\n  <body></body>\t\n</html>\n\n\n";
        assert_eq!(Tidy::tidy(input), "<html>\n\n  <body></body>\n</html>\n");
    }
}
