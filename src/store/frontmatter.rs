//! Minimal front-matter grammar: a `---` delimited block of `key: value`
//! lines (bare scalars, double-quoted strings, and `[a, b]` lists), followed
//! by a `# Title` heading and a free-form body. Malformed lines are reported
//! with their line numbers instead of being best-effort matched.

use std::fmt::Write as _;

use crate::error::{Error, Result};

const DELIMITER: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A scalar; `quoted` records whether the source wrapped it in quotes so
    /// round-trips preserve the author's style.
    Scalar { value: String, quoted: bool },
    List(Vec<String>),
}

impl Value {
    pub fn scalar(value: impl Into<String>) -> Self {
        Value::Scalar {
            value: value.into(),
            quoted: false,
        }
    }

    pub fn quoted(value: impl Into<String>) -> Self {
        Value::Scalar {
            value: value.into(),
            quoted: true,
        }
    }
}

/// Ordered key/value block at the top of an item file.
#[derive(Debug, Clone, Default)]
pub struct FrontMatter {
    entries: Vec<(String, Value)>,
}

impl FrontMatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn scalar(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Scalar { value, .. }) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn list(&self, key: &str) -> Option<&[String]> {
        match self.get(key) {
            Some(Value::List(items)) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A parsed item file: front matter, title heading, and body.
#[derive(Debug, Clone)]
pub struct Document {
    pub front_matter: FrontMatter,
    pub title: String,
    pub body: String,
}

/// Parse a full item file. All malformed front-matter lines are reported in
/// one error so the operator can fix the file in a single pass.
pub fn parse(content: &str) -> Result<Document> {
    let mut lines = content.lines().enumerate();

    match lines.next() {
        Some((_, line)) if line.trim_end() == DELIMITER => {}
        _ => {
            return Err(Error::MalformedInput(
                "missing opening '---' delimiter".to_string(),
            ))
        }
    }

    let mut front_matter = FrontMatter::new();
    let mut bad_lines: Vec<String> = Vec::new();
    let mut closed = false;
    let mut body_start = 0usize;

    for (idx, line) in lines.by_ref() {
        if line.trim_end() == DELIMITER {
            closed = true;
            body_start = idx + 1;
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok((key, value)) => front_matter.set(key, value),
            Err(reason) => bad_lines.push(format!("line {}: {}", idx + 1, reason)),
        }
    }

    if !closed {
        return Err(Error::MalformedInput(
            "missing closing '---' delimiter".to_string(),
        ));
    }
    if !bad_lines.is_empty() {
        return Err(Error::MalformedInput(bad_lines.join("; ")));
    }

    let rest: Vec<&str> = content.lines().skip(body_start).collect();
    let mut title = String::new();
    let mut body_lines: &[&str] = &[];
    for (pos, line) in rest.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(heading) = line.strip_prefix("# ") {
            title = heading.trim().to_string();
            body_lines = &rest[pos + 1..];
        } else {
            return Err(Error::MalformedInput(format!(
                "expected '# Title' heading after front matter, found '{line}'"
            )));
        }
        break;
    }
    if title.is_empty() {
        return Err(Error::MalformedInput(
            "missing '# Title' heading".to_string(),
        ));
    }

    let body = body_lines.join("\n").trim().to_string();

    Ok(Document {
        front_matter,
        title,
        body,
    })
}

fn parse_line(line: &str) -> std::result::Result<(String, Value), String> {
    let Some((key, raw)) = line.split_once(':') else {
        return Err(format!("expected 'key: value', found '{}'", line.trim()));
    };
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid key '{key}'"));
    }
    let raw = raw.trim();
    let value = if let Some(inner) = raw.strip_prefix('[') {
        let Some(inner) = inner.strip_suffix(']') else {
            return Err(format!("unterminated list '{raw}'"));
        };
        let items = inner
            .split(',')
            .map(|part| unquote(part.trim()).map(|(v, _)| v))
            .filter(|item| !matches!(item, Ok(ref v) if v.is_empty()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Value::List(items)
    } else {
        let (value, quoted) = unquote(raw)?;
        Value::Scalar { value, quoted }
    };
    Ok((key.to_string(), value))
}

fn unquote(raw: &str) -> std::result::Result<(String, bool), String> {
    if let Some(inner) = raw.strip_prefix('"') {
        let mut value = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        loop {
            match chars.next() {
                Some('"') => {
                    if !chars.as_str().trim().is_empty() {
                        return Err(format!("trailing content after closing quote in '{raw}'"));
                    }
                    return Ok((value, true));
                }
                Some('\\') => match chars.next() {
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    _ => return Err(format!("bad escape sequence in '{raw}'")),
                },
                Some(ch) => value.push(ch),
                None => return Err(format!("unterminated quoted string '{raw}'")),
            }
        }
    } else if raw.contains('"') {
        Err(format!("stray quote in value '{raw}'"))
    } else {
        Ok((raw.to_string(), false))
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Render a document back to its on-disk form.
pub fn render(doc: &Document) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    for (key, value) in doc.front_matter.iter() {
        match value {
            Value::Scalar { value, quoted } => {
                // Anything the line grammar cannot hold bare gets quoted and
                // escaped, whatever the author's original style was.
                if *quoted || value.contains(['"', '\\', '\n', '\r']) {
                    let _ = writeln!(out, "{key}: \"{}\"", escape(value));
                } else {
                    let _ = writeln!(out, "{key}: {value}");
                }
            }
            Value::List(items) => {
                let _ = writeln!(out, "{key}: [{}]", items.join(", "));
            }
        }
    }
    out.push_str(DELIMITER);
    // The heading must stay on one line.
    let title = doc.title.replace(['\r', '\n'], " ");
    let _ = write!(out, "\n\n# {title}\n");
    if !doc.body.is_empty() {
        let _ = write!(out, "\n{}\n", doc.body);
    }
    out
}
