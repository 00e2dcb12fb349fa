use std::io;
use std::path::{Path, PathBuf};

use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};

use crate::asset::Asset;
use crate::util::normalize;
use crate::transform::{Context, Transform, TransformError};

/// Compiles SCSS and indented Sass to CSS with `grass`.
///
/// `@import` and `@use` resolve against the source snapshot in the context,
/// never against the file system, so partials edited in watch mode are
/// picked up by the next run.
#[cfg(feature = "sass")]
#[derive(Debug, Default)]
pub struct Sass {
    quiet: bool,
}

#[cfg(feature = "sass")]
impl Sass {
    /// Suppresses `@warn` and `@debug` output.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

#[cfg(feature = "sass")]
#[derive(Debug)]
struct SnapshotFs<'a> {
    cx: &'a Context,
    entry: PathBuf,
    entry_text: &'a str,
}

#[cfg(feature = "sass")]
impl grass::Fs for SnapshotFs<'_> {
    fn is_dir(&self, path: &Path) -> bool {
        self.cx.sources().map_or(false, |s| s.contains_dir(path))
    }

    fn is_file(&self, path: &Path) -> bool {
        normalize(path) == self.entry || self.cx.read(path).is_some()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        if normalize(path) == self.entry {
            return Ok(self.entry_text.as_bytes().to_vec());
        }

        self.cx.read(path)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}

#[cfg(feature = "sass")]
impl Transform for Sass {
    fn name(&self) -> &'static str {
        "sass"
    }

    fn apply(&self, asset: &Asset, cx: &Context) -> Result<Vec<Asset>, TransformError> {
        let fs = SnapshotFs {
            cx,
            entry: normalize(asset.path()),
            entry_text: asset.text(self.name())?,
        };

        let options = grass::Options::default()
            .fs(&fs)
            .style(grass::OutputStyle::Expanded)
            .quiet(self.quiet);

        let css = grass::from_path(asset.path(), &options)
            .map_err(|e| TransformError::new(self.name(), asset.path(), e))?;

        Ok(vec![asset.with_path(asset.path().with_extension("css")).with_content(css)])
    }

    fn needs_sources(&self) -> bool {
        true
    }
}

const fn version(major: u32, minor: u32) -> Option<u32> {
    Some(major << 16 | minor << 8)
}

/// The browser set prefixes are generated for when none is given.
pub fn default_browsers() -> Browsers {
    Browsers {
        android: version(109, 0),
        chrome: version(109, 0),
        edge: version(109, 0),
        firefox: version(115, 0),
        ie: None,
        ios_saf: version(14, 0),
        opera: version(95, 0),
        safari: version(14, 0),
        samsung: version(20, 0),
    }
}

/// Prefixes are added and dropped by `StyleSheet::minify`, so it runs even
/// when the output keeps its formatting.
fn print_css(css: &str, minify: bool, targets: Targets) -> Result<String, String> {
    let mut sheet = StyleSheet::parse(css, ParserOptions::default())
        .map_err(|e| e.to_string())?;

    sheet.minify(MinifyOptions { targets, ..MinifyOptions::default() })
        .map_err(|e| e.to_string())?;

    let printed = sheet.to_css(PrinterOptions { minify, targets, ..PrinterOptions::default() })
        .map_err(|e| e.to_string())?;

    Ok(printed.code)
}

/// Adds the vendor prefixes a browser set needs, keeping formatting.
#[derive(Debug, Clone)]
pub struct Autoprefix {
    browsers: Browsers,
}

impl Autoprefix {
    pub fn new(browsers: Browsers) -> Self {
        Autoprefix { browsers }
    }
}

impl Default for Autoprefix {
    fn default() -> Self {
        Autoprefix::new(default_browsers())
    }
}

impl Transform for Autoprefix {
    fn name(&self) -> &'static str {
        "autoprefix"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let css = asset.text(self.name())?;
        let prefixed = print_css(css, false, Targets::from(self.browsers))
            .map_err(|e| TransformError::new(self.name(), asset.path(), e))?;

        Ok(vec![asset.with_content(prefixed)])
    }
}

/// Minifies CSS for a browser set. Use the same set as [`Autoprefix`] or
/// the prefixes it added are dropped again.
#[derive(Debug, Clone)]
pub struct MinifyCss {
    browsers: Browsers,
}

impl MinifyCss {
    pub fn new(browsers: Browsers) -> Self {
        MinifyCss { browsers }
    }
}

impl Default for MinifyCss {
    fn default() -> Self {
        MinifyCss::new(default_browsers())
    }
}

impl Transform for MinifyCss {
    fn name(&self) -> &'static str {
        "minify-css"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let css = asset.text(self.name())?;
        let minified = print_css(css, true, Targets::from(self.browsers))
            .map_err(|e| TransformError::new(self.name(), asset.path(), e))?;

        Ok(vec![asset.with_content(minified)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Snapshot;

    fn run(transform: &dyn Transform, asset: &Asset, cx: &Context) -> Asset {
        let mut out = transform.apply(asset, cx).unwrap();
        assert_eq!(out.len(), 1);
        out.remove(0)
    }

    #[cfg(feature = "sass")]
    #[test]
    fn sass_imports_come_from_the_snapshot() {
        let entry = "@import \"blocks/a\";\n.b { .c { margin: 0; } }\n";
        let cx = Context::with_sources(Snapshot::from_files("src/styles", [
            ("styles.scss", entry),
            ("blocks/_a.scss", "$c: red;\n.a { color: $c; }\n"),
        ]));

        let css = run(&Sass::default(), &Asset::new("styles.scss", entry), &cx);
        assert_eq!(css.path(), Path::new("styles.css"));

        let text = css.content().as_text().unwrap();
        assert!(text.contains(".a {\n  color: red;\n}"), "{text}");
        assert!(text.contains(".b .c {\n  margin: 0;\n}"), "{text}");
    }

    #[cfg(feature = "sass")]
    #[test]
    fn sass_syntax_errors_name_the_file() {
        let cx = Context::with_sources(Snapshot::from_files("src/styles", [("bad.scss", ".a { color: ")]));
        let error = Sass::default().apply(&Asset::new("bad.scss", ".a { color: "), &cx).unwrap_err();
        assert_eq!(error.stage, "sass");
        assert_eq!(error.source_path, Path::new("bad.scss"));
    }

    #[test]
    fn prefixes_follow_the_browser_set() {
        let asset = Asset::new("styles.css", ".a { user-select: none; display: flex; }");
        let prefixed = run(&Autoprefix::default(), &asset, &Context::empty());
        let text = prefixed.content().as_text().unwrap();
        assert!(text.contains("-webkit-user-select: none"), "{text}");
        assert!(text.contains("  user-select: none"), "{text}");
        assert!(text.contains("display: flex"), "{text}");

        let chrome = Browsers { chrome: version(109, 0), ..Browsers::default() };
        let prefixed = run(&Autoprefix::new(chrome), &asset, &Context::empty());
        let text = prefixed.content().as_text().unwrap();
        assert!(!text.contains("-webkit-user-select"), "{text}");
    }

    #[test]
    fn minifying_keeps_the_prefixes_autoprefix_added() {
        let asset = Asset::new("styles.css", ".a { user-select: none; }");
        let prefixed = run(&Autoprefix::default(), &asset, &Context::empty());
        let minified = run(&MinifyCss::default(), &prefixed, &Context::empty());
        assert_eq!(minified.content().as_text(), Some(".a{-webkit-user-select:none;user-select:none}"));
    }

    #[test]
    fn minified_css_has_no_extra_whitespace() {
        let asset = Asset::new("styles.min.css", ".a {\n  color: red;\n}\n\n/* done */\n");
        let minified = run(&MinifyCss::default(), &asset, &Context::empty());
        assert_eq!(minified.content().as_text(), Some(".a{color:red}"));

        let error = MinifyCss::default().apply(&Asset::new("x.css", vec![0xff, 0xfe]), &Context::empty()).unwrap_err();
        assert_eq!(error.stage, "minify-css");
    }
}
