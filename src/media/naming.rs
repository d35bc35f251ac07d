//! Logical name handling
//!
//! Logical names are POSIX-style relative paths supplied by callers. They are
//! cleaned (collapsed, backslashes converted) and then normalized onto the
//! configured `location` root. Normalization never lets a name escape the root.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{Error, Result};

/// Characters left untouched when turning a key into a URI path.
const URI_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/')
    .remove(b'!')
    .remove(b'*')
    .remove(b'(')
    .remove(b')')
    .remove(b'\'');

/// Collapse `.`/`..` segments and duplicate separators, POSIX rules.
///
/// Leading `..` segments of a relative path are kept; on an absolute path they
/// are dropped. Exactly two leading slashes are preserved, three or more
/// collapse to one. An empty result becomes `"."`.
pub fn normpath(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let initial_slashes = if path.starts_with("//") && !path.starts_with("///") {
        2
    } else if path.starts_with('/') {
        1
    } else {
        0
    };

    let mut comps: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if comp != ".."
            || (initial_slashes == 0 && comps.is_empty())
            || comps.last() == Some(&"..")
        {
            comps.push(comp);
        } else if !comps.is_empty() {
            comps.pop();
        }
    }

    let mut out = "/".repeat(initial_slashes);
    out.push_str(&comps.join("/"));
    if out.is_empty() {
        ".".to_string()
    } else {
        out
    }
}

/// Join two POSIX paths. An absolute `b` replaces `a`.
pub fn join(a: &str, b: &str) -> String {
    if b.starts_with('/') || a.is_empty() {
        b.to_string()
    } else if a.ends_with('/') {
        format!("{a}{b}")
    } else {
        format!("{a}/{b}")
    }
}

/// Split into `(directory, file name)` at the last separator.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => {
            let head = &path[..=idx];
            let trimmed = head.trim_end_matches('/');
            let head = if trimmed.is_empty() { head } else { trimmed };
            (head, &path[idx + 1..])
        }
        None => ("", path),
    }
}

/// Split a file name into `(stem, extension)`. Leading dots belong to the stem.
pub fn splitext(file_name: &str) -> (&str, &str) {
    if let Some(dot) = file_name.rfind('.') {
        if file_name[..dot].chars().any(|c| c != '.') {
            return (&file_name[..dot], &file_name[dot..]);
        }
    }
    (file_name, "")
}

/// Clean a caller-supplied name so Windows-style paths behave.
pub fn clean_name(name: &str) -> String {
    let mut clean = normpath(name).replace('\\', "/");
    if name.ends_with('/') && !clean.ends_with('/') {
        clean.push('/');
    }
    clean
}

/// Join `names` onto `location`, rejecting results outside of it.
///
/// The returned key never has a leading slash. Resolving exactly to the root
/// yields the root with a trailing slash (or `""` for an empty root).
pub fn normalize_name(location: &str, names: &[&str]) -> Result<String> {
    let base_path = location.trim_end_matches('/');
    let mut final_path = format!("{base_path}/");

    for path in names {
        let mut next = normpath(&join(&final_path, path));
        if path.ends_with('/') || format!("{next}/") == final_path {
            next.push('/');
        }
        final_path = next;
    }

    if final_path == base_path {
        final_path.push('/');
    }

    if !final_path.starts_with(base_path)
        || final_path.as_bytes().get(base_path.len()) != Some(&b'/')
    {
        return Err(Error::OutsideBasePath(names.join("/")));
    }

    Ok(final_path.trim_start_matches('/').to_string())
}

/// Clean then normalize in one step.
pub fn resolve(location: &str, name: &str) -> Result<String> {
    normalize_name(location, &[&clean_name(name)])
}

/// Truncate the stem of `name` so it fits into `max_length` characters.
pub fn get_available_overwrite_name(name: &str, max_length: Option<usize>) -> Result<String> {
    let length = name.chars().count();
    let max_length = match max_length {
        Some(max) if length > max => max,
        _ => return Ok(name.to_string()),
    };

    let (dir_name, file_name) = split(name);
    let (file_root, file_ext) = splitext(file_name);
    let truncation = length - max_length;

    let root_len = file_root.chars().count();
    if truncation >= root_len {
        return Err(Error::TruncationExhausted(name.to_string()));
    }
    let file_root: String = file_root.chars().take(root_len - truncation).collect();

    Ok(join(dir_name, &format!("{file_root}{file_ext}")))
}

/// Random alternative for a colliding name: `<stem>_<7 random chars><ext>`.
pub fn alternative_name(file_root: &str, file_ext: &str) -> String {
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(7)
        .collect();
    format!("{file_root}_{suffix}{file_ext}")
}

/// Percent-encode a key for use as a URL path.
pub fn filepath_to_uri(path: &str) -> String {
    utf8_percent_encode(&path.replace('\\', "/"), URI_PATH).to_string()
}

/// Charset used to turn logical names into backend keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameCharset {
    #[default]
    Utf8,
}

impl NameCharset {
    pub fn encode(&self, name: &str) -> String {
        match self {
            NameCharset::Utf8 => name.to_string(),
        }
    }

    pub fn decode(&self, key: &[u8]) -> Result<String> {
        match self {
            NameCharset::Utf8 => Ok(String::from_utf8(key.to_vec())?),
        }
    }
}

impl std::str::FromStr for NameCharset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(NameCharset::Utf8),
            other => Err(Error::config(format!("unsupported file name charset: {other}"))),
        }
    }
}
