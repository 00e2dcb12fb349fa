use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rustc_hash::FxHashSet;

use crate::asset::Asset;
use crate::transform::{Context, Merge, TransformError};

static ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<svg\b([^>]*)>(.*)</svg>").expect("valid regex")
});

static VIEW_BOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bviewBox\s*=\s*["']([^"']*)["']"#).expect("valid regex")
});

static ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\s)id\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});

static URL_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"url\(\s*#([^)\s]+)\s*\)").expect("valid regex")
});

static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"((?:xlink:)?href)\s*=\s*["']#([^"']+)["']"#).expect("valid regex")
});

/// Combines SVG icons into one sprite sheet of `<symbol>`s.
///
/// Each icon becomes a symbol whose id is its file stem; ids inside the
/// icon, and the `url(#…)` and `href="#…"` references to them, are
/// prefixed with `<stem>-` so icons cannot collide.
#[derive(Debug, Clone)]
pub struct SvgStore {
    file_name: PathBuf,
}

impl SvgStore {
    pub fn new<P: Into<PathBuf>>(file_name: P) -> Self {
        SvgStore { file_name: file_name.into() }
    }

    fn symbol(&self, stem: &str, asset: &Asset) -> Result<String, TransformError> {
        let svg = asset.text(self.name())?;
        let root = ROOT.captures(svg).ok_or_else(|| {
            TransformError::new(self.name(), asset.path(), "no root <svg> element")
        })?;

        let (attrs, inner) = (&root[1], &root[2]);
        let inner = ID.replace_all(inner, |c: &Captures| format!("{}id=\"{stem}-{}\"", &c[1], &c[2]));
        let inner = URL_REF.replace_all(&inner, |c: &Captures| format!("url(#{stem}-{})", &c[1]));
        let inner = HREF.replace_all(&inner, |c: &Captures| format!("{}=\"#{stem}-{}\"", &c[1], &c[2]));

        let view_box = VIEW_BOX.captures(attrs)
            .map(|c| format!(" viewBox=\"{}\"", &c[1]))
            .unwrap_or_default();

        Ok(format!("<symbol id=\"{stem}\"{view_box}>{}</symbol>", inner.trim()))
    }
}

impl Default for SvgStore {
    fn default() -> Self {
        SvgStore::new("sprite.svg")
    }
}

impl Merge for SvgStore {
    fn name(&self) -> &'static str {
        "svgstore"
    }

    fn merge(&self, assets: Vec<Asset>, _: &Context) -> Result<Vec<Asset>, TransformError> {
        if assets.is_empty() {
            return Ok(vec![]);
        }

        let mut seen = FxHashSet::default();
        let mut sheet = String::from(concat!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" ",
            "xmlns:xlink=\"http://www.w3.org/1999/xlink\">"
        ));

        for asset in &assets {
            let stem = asset.file_stem();
            if !seen.insert(stem.to_string()) {
                let cause = format!("another icon already uses the symbol id `{stem}`");
                return Err(TransformError::new(self.name(), asset.path(), cause));
            }

            sheet.push_str(&self.symbol(stem, asset)?);
        }

        sheet.push_str("</svg>");
        Ok(vec![Asset::new(&self.file_name, sheet)])
    }
}
