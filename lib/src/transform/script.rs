use crate::asset::Asset;
use crate::transform::{Context, Rename, Transform, TransformError};

/// Strips comments and redundant whitespace from JavaScript.
///
/// Line breaks survive, collapsed to one, so automatic semicolon insertion
/// reads the output the way it read the input. Names are never mangled.
/// With [`MinifyJs::suffixed()`] the asset is kept as it was and the
/// minified copy is emitted next to it: `main.js` and `main.min.js`.
#[derive(Debug, Default, Clone)]
pub struct MinifyJs {
    rename: Option<Rename>,
}

impl MinifyJs {
    pub fn suffixed<S: Into<String>>(suffix: S) -> Self {
        MinifyJs { rename: Some(Rename::suffix(suffix)) }
    }
}

impl Transform for MinifyJs {
    fn name(&self) -> &'static str {
        "minify-js"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let js = asset.text(self.name())?;
        let minified = minify_js(js).map_err(|e| TransformError::new(self.name(), asset.path(), e))?;
        match &self.rename {
            Some(rename) => {
                let copy = asset.with_path(rename.rename(asset.path())).with_content(minified);
                Ok(vec![asset.clone(), copy])
            }
            None => Ok(vec![asset.with_content(minified)]),
        }
    }
}

/// Keywords after which a `/` starts a regular expression, not a division.
const BEFORE_EXPRESSION: &[&[u8]] = &[
    b"return", b"typeof", b"instanceof", b"in", b"of", b"new", b"delete",
    b"void", b"throw", b"case", b"do", b"else", b"yield", b"await",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Gap {
    None,
    Space,
    Newline,
}

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

struct Minifier<'a> {
    src: &'a [u8],
    pos: usize,
    out: Vec<u8>,
    gap: Gap,
    /// Whether the last token ends an expression, making `/` a division.
    after_operand: bool,
}

impl<'a> Minifier<'a> {
    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    /// Emits the whitespace owed before a token starting with `next`.
    fn flush(&mut self, next: u8) {
        let gap = std::mem::replace(&mut self.gap, Gap::None);
        let Some(&last) = self.out.last() else { return };
        match gap {
            Gap::Newline => self.out.push(b'\n'),
            Gap::Space if is_word(last) && is_word(next) => self.out.push(b' '),
            Gap::Space if last == next && matches!(next, b'+' | b'-' | b'/') => self.out.push(b' '),
            _ => {}
        }
    }

    /// Copies a string, template or regex body through its closing `quote`.
    fn quoted(&mut self, quote: u8, what: &str) -> Result<(), String> {
        let start = self.pos;
        self.pos += 1;
        let mut in_class = false;
        while let Some(b) = self.peek(0) {
            self.pos += 1;
            match b {
                b'\\' => self.pos += 1,
                b'\n' if quote != b'`' => break,
                b'[' if quote == b'/' => in_class = true,
                b']' if quote == b'/' => in_class = false,
                b if b == quote && !in_class => {
                    self.out.extend_from_slice(&self.src[start..self.pos]);
                    return Ok(());
                }
                _ => {}
            }
        }

        Err(format!("unterminated {what} at byte {start}"))
    }

    fn run(mut self) -> Result<String, String> {
        while let Some(b) = self.peek(0) {
            match b {
                b'\n' => {
                    self.gap = Gap::Newline;
                    self.pos += 1;
                }
                b' ' | b'\t' | b'\r' => {
                    self.gap = self.gap.max(Gap::Space);
                    self.pos += 1;
                }
                b'/' if self.peek(1) == Some(b'/') => {
                    let rest = &self.src[self.pos..];
                    self.pos += memchr::memchr(b'\n', rest).unwrap_or(rest.len());
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    let rest = &self.src[self.pos + 2..];
                    let Some(end) = memchr::memmem::find(rest, b"*/") else {
                        return Err(format!("unterminated comment at byte {}", self.pos));
                    };

                    let gap = match memchr::memchr(b'\n', &rest[..end]) {
                        Some(_) => Gap::Newline,
                        None => Gap::Space,
                    };

                    self.gap = self.gap.max(gap);
                    self.pos += end + 4;
                }
                b'\'' | b'"' | b'`' => {
                    self.flush(b);
                    self.quoted(b, "string")?;
                    self.after_operand = true;
                }
                b'/' if !self.after_operand => {
                    self.flush(b);
                    self.quoted(b'/', "regular expression")?;
                    self.after_operand = true;
                }
                b if is_word(b) => {
                    let start = self.pos;
                    while self.peek(0).map_or(false, is_word) {
                        self.pos += 1;
                    }

                    let word = &self.src[start..self.pos];
                    self.flush(b);
                    self.out.extend_from_slice(word);
                    self.after_operand = !BEFORE_EXPRESSION.contains(&word);
                }
                _ => {
                    self.flush(b);
                    self.out.push(b);
                    self.pos += 1;
                    self.after_operand = matches!(b, b')' | b']' | b'}');
                }
            }
        }

        String::from_utf8(self.out).map_err(|e| e.to_string())
    }
}

pub fn minify_js(js: &str) -> Result<String, String> {
    let minifier = Minifier {
        src: js.as_bytes(),
        pos: 0,
        out: Vec::with_capacity(js.len()),
        gap: Gap::None,
        after_operand: false,
    };

    minifier.run()
}
