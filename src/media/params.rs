//! Per-object write parameters

use std::collections::BTreeMap;

use serde::Deserialize;

use super::naming::splitext;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Extra parameters applied to every written object.
///
/// Fields set here override the computed ACL, content type and content encoding.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObjectParameters {
    pub acl: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Parameters sent with a put or multipart initiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteParams {
    pub acl: Option<String>,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl WriteParams {
    /// Compute parameters for `name`.
    ///
    /// Content type precedence: caller-supplied, guessed from the extension,
    /// then `application/octet-stream`. `extra` is merged last.
    pub fn compute(
        name: &str,
        content_type: Option<&str>,
        default_acl: Option<&str>,
        extra: &ObjectParameters,
    ) -> Self {
        let (guessed, encoding) = guess_type(name);
        let content_type = content_type
            .filter(|ct| !ct.is_empty())
            .map(str::to_string)
            .or(guessed)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let mut params = WriteParams {
            acl: default_acl.filter(|acl| !acl.is_empty()).map(str::to_string),
            content_type,
            content_encoding: encoding.map(str::to_string),
            ..Default::default()
        };
        params.merge(extra);
        params
    }

    fn merge(&mut self, extra: &ObjectParameters) {
        if let Some(acl) = &extra.acl {
            self.acl = Some(acl.clone());
        }
        if let Some(content_type) = &extra.content_type {
            self.content_type = content_type.clone();
        }
        if let Some(encoding) = &extra.content_encoding {
            self.content_encoding = Some(encoding.clone());
        }
        self.cache_control = extra.cache_control.clone().or(self.cache_control.take());
        self.content_disposition = extra
            .content_disposition
            .clone()
            .or(self.content_disposition.take());
        self.content_language = extra.content_language.clone().or(self.content_language.take());
        self.storage_class = extra.storage_class.clone().or(self.storage_class.take());
        self.server_side_encryption = extra
            .server_side_encryption
            .clone()
            .or(self.server_side_encryption.take());
        self.metadata
            .extend(extra.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Guess `(content type, content encoding)` from a file name.
///
/// A compression suffix yields the encoding and the type is guessed from the
/// remaining extension, so `notes.txt.gz` is `text/plain` encoded with `gzip`.
pub fn guess_type(name: &str) -> (Option<String>, Option<&'static str>) {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    let (stem, ext) = splitext(file_name);

    let encoding = match ext {
        ".gz" => Some("gzip"),
        ".bz2" => Some("bzip2"),
        ".xz" => Some("xz"),
        ".br" => Some("br"),
        ".Z" => Some("compress"),
        _ => None,
    };

    let typed = if encoding.is_some() { stem } else { file_name };
    let (_, ext) = splitext(typed);
    if ext.len() <= 1 {
        return (None, encoding);
    }

    let content_type = mime_guess::from_ext(&ext[1..])
        .first()
        .map(|mime| mime.essence_str().to_string());
    (content_type, encoding)
}
