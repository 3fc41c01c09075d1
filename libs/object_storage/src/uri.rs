//! Uniform addressing for objects across all supported stores.
//!
//! A uri is `scheme://authority/path`: the authority is the bucket,
//! container or namespace (empty for `file`), the path is `/`-separated
//! with a trailing slash denoting a directory or prefix. Percent-encoded
//! characters are preserved byte for byte on input and output; they are
//! decoded only for display, never for routing.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    File,
    S3,
    Gcs,
    Az,
    Aifs,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::S3 => "s3",
            Scheme::Gcs => "gcs",
            Scheme::Az => "az",
            Scheme::Aifs => "aifs",
        }
    }

    pub fn all() -> [Scheme; 5] {
        [Scheme::File, Scheme::S3, Scheme::Gcs, Scheme::Az, Scheme::Aifs]
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Scheme::File),
            "s3" => Ok(Scheme::S3),
            "gcs" => Ok(Scheme::Gcs),
            "az" => Ok(Scheme::Az),
            "aifs" => Ok(Scheme::Aifs),
            other => Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("unsupported uri scheme '{other}'"),
            )),
        }
    }
}

/// A normalized object uri.
///
/// Internally the path never carries a leading slash; a trailing slash (or
/// an empty path, the scheme root) marks a directory. Normalization
/// collapses `//` runs and resolves `.`/`..` within the path only; case is
/// preserved throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    scheme: Scheme,
    authority: String,
    path: String,
}

impl ObjectUri {
    /// Parses and normalizes a uri string.
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let (scheme_str, rest) = input.split_once("://").ok_or_else(|| {
            StoreError::new(
                ErrorKind::MalformedUri,
                format!("'{input}' is not a uri: missing '://'"),
            )
        })?;
        let scheme = Scheme::from_str(scheme_str)?;

        let (authority, raw_path) = match scheme {
            Scheme::File => {
                // `file` has no authority: `file:///absolute/path`. (On
                // Windows the drive letter rides in the path:
                // `file://C:/path`; this build targets POSIX semantics.)
                let Some(path) = rest.strip_prefix('/') else {
                    return Err(StoreError::new(
                        ErrorKind::MalformedUri,
                        format!("'{input}': file uris must use an absolute path"),
                    ));
                };
                (String::new(), path)
            }
            _ => {
                let (authority, path) = match rest.split_once('/') {
                    Some((a, p)) => (a, p),
                    None => (rest, ""),
                };
                if authority.is_empty() {
                    return Err(StoreError::new(
                        ErrorKind::MalformedUri,
                        format!("'{input}': missing bucket/container/namespace"),
                    ));
                }
                (authority.to_string(), path)
            }
        };

        let path = normalize_path(raw_path);
        Ok(ObjectUri {
            scheme,
            authority,
            path,
        })
    }

    /// Builds a uri from a raw backend key. The key is normalized the same
    /// way [`Self::parse`] normalizes a path.
    pub fn from_parts(scheme: Scheme, authority: &str, key: &str) -> Result<Self, StoreError> {
        if scheme != Scheme::File && authority.is_empty() {
            return Err(StoreError::new(
                ErrorKind::MalformedUri,
                "missing bucket/container/namespace",
            ));
        }
        Ok(ObjectUri {
            scheme,
            authority: authority.to_string(),
            path: normalize_path(key),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Bucket, container or namespace. Empty for `file`.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The raw, normalized key: no leading slash, trailing slash iff dir.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A directory is marked by a trailing slash; the scheme root (empty
    /// path) is always a directory.
    pub fn is_dir(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/')
    }

    /// Last path segment, raw (still percent-encoded if it was on input).
    /// The scheme root answers with the authority, or `/` for `file`.
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, last)) => last,
            None if !trimmed.is_empty() => trimmed,
            None if !self.authority.is_empty() => &self.authority,
            None => "/",
        }
    }

    /// Percent-decoded name, for UI display only. Routing always uses the
    /// raw bytes of [`Self::name`].
    pub fn display_name(&self) -> String {
        match urlencoding::decode(self.name()) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => self.name().to_string(),
        }
    }

    /// Appends one segment to a directory uri. A trailing slash on the
    /// segment produces a directory uri.
    pub fn join(&self, segment: &str) -> ObjectUri {
        debug_assert!(self.is_dir(), "join on non-directory uri {self}");
        let mut joined = self.path.clone();
        joined.push_str(segment);
        ObjectUri {
            scheme: self.scheme,
            authority: self.authority.clone(),
            path: normalize_path(&joined),
        }
    }

    /// Parent directory. The parent of `s3://b/x/y` is `s3://b/x/`, the
    /// parent of any first-level entry is the scheme root `s3://b/`, and
    /// the scheme root is its own parent.
    pub fn parent(&self) -> ObjectUri {
        let trimmed = self.path.trim_end_matches('/');
        let parent_path = match trimmed.rsplit_once('/') {
            Some((init, _)) => format!("{init}/"),
            None => String::new(),
        };
        ObjectUri {
            scheme: self.scheme,
            authority: self.authority.clone(),
            path: parent_path,
        }
    }

    /// Re-marks this uri as a directory (used when a backend learns that a
    /// bare key actually names a prefix).
    pub fn as_dir(&self) -> ObjectUri {
        if self.is_dir() {
            return self.clone();
        }
        ObjectUri {
            scheme: self.scheme,
            authority: self.authority.clone(),
            path: format!("{}/", self.path),
        }
    }

    /// Strips the trailing slash, yielding the object form of this uri.
    pub fn as_object(&self) -> ObjectUri {
        ObjectUri {
            scheme: self.scheme,
            authority: self.authority.clone(),
            path: self.path.trim_end_matches('/').to_string(),
        }
    }

    /// Absolute filesystem path for `file` uris.
    pub fn local_path(&self) -> Utf8PathBuf {
        debug_assert_eq!(self.scheme, Scheme::File);
        Utf8PathBuf::from(format!("/{}", self.path.trim_end_matches('/')))
    }

    /// Scheme-sensitive equality. Bucketed schemes compare raw bytes;
    /// `file` paths follow platform rules: exact on this (POSIX) build,
    /// ASCII-case-insensitive where the platform's filesystems are
    /// case-preserving but case-insensitive.
    pub fn same_location(&self, other: &ObjectUri) -> bool {
        if self.scheme != other.scheme {
            return false;
        }
        if self.scheme == Scheme::File && cfg!(any(target_os = "macos", target_os = "windows")) {
            return self.path.eq_ignore_ascii_case(&other.path);
        }
        self.authority == other.authority && self.path == other.path
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::File => write!(f, "file:///{}", self.path),
            _ => write!(f, "{}://{}/{}", self.scheme, self.authority, self.path),
        }
    }
}

impl Serialize for ObjectUri {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;
        ObjectUri::parse(&str).map_err(serde::de::Error::custom)
    }
}

/// Collapses `//`, resolves `.` and `..` (never escaping the root), keeps
/// the trailing slash that marks a directory.
fn normalize_path(raw: &str) -> String {
    let is_dir = raw.is_empty() || raw.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut path = segments.join("/");
    if is_dir && !path.is_empty() {
        path.push('/');
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes() {
        let uri = ObjectUri::parse("s3://bucket//a/./b/../c/").unwrap();
        assert_eq!(uri.scheme(), Scheme::S3);
        assert_eq!(uri.authority(), "bucket");
        assert_eq!(uri.path(), "a/c/");
        assert!(uri.is_dir());
        assert_eq!(uri.to_string(), "s3://bucket/a/c/");
    }

    #[test]
    fn parse_stringify_roundtrip() {
        for input in [
            "s3://bucket/key",
            "s3://bucket/key/",
            "s3://bucket/",
            "gcs://b/deep/nested/object.bin",
            "az://container/blob",
            "aifs://ns/main/asset",
            "file:///tmp/x.txt",
            "file:///",
        ] {
            let parsed = ObjectUri::parse(input).unwrap();
            let reparsed = ObjectUri::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "roundtrip of {input}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            ObjectUri::parse("no-scheme").unwrap_err().kind(),
            ErrorKind::MalformedUri
        );
        assert_eq!(
            ObjectUri::parse("ftp://host/x").unwrap_err().kind(),
            ErrorKind::UnsupportedScheme
        );
        assert_eq!(
            ObjectUri::parse("s3://").unwrap_err().kind(),
            ErrorKind::MalformedUri
        );
        assert_eq!(
            ObjectUri::parse("file://relative/path").unwrap_err().kind(),
            ErrorKind::MalformedUri
        );
    }

    #[test]
    fn empty_path_is_scheme_root() {
        let root = ObjectUri::parse("s3://bucket").unwrap();
        assert!(root.is_dir());
        assert_eq!(root.path(), "");
        assert_eq!(root.to_string(), "s3://bucket/");
        assert_eq!(root.name(), "bucket");
    }

    #[test]
    fn parent_walks_up_and_stops_at_root() {
        let uri = ObjectUri::parse("s3://b/x/y").unwrap();
        assert_eq!(uri.parent().to_string(), "s3://b/x/");
        assert_eq!(uri.parent().parent().to_string(), "s3://b/");
        let root = uri.parent().parent();
        assert_eq!(root.parent(), root);

        let file_root = ObjectUri::parse("file:///").unwrap();
        assert_eq!(file_root.parent(), file_root);
    }

    #[test]
    fn join_appends_segments() {
        let dir = ObjectUri::parse("gcs://b/dir/").unwrap();
        assert_eq!(dir.join("file.txt").to_string(), "gcs://b/dir/file.txt");
        assert_eq!(dir.join("sub/").to_string(), "gcs://b/dir/sub/");
    }

    #[test]
    fn name_is_last_segment() {
        assert_eq!(ObjectUri::parse("s3://b/x/y").unwrap().name(), "y");
        assert_eq!(ObjectUri::parse("s3://b/x/").unwrap().name(), "x");
        assert_eq!(ObjectUri::parse("file:///").unwrap().name(), "/");
    }

    #[test]
    fn percent_encoding_preserved_for_routing() {
        let uri = ObjectUri::parse("s3://b/some%20file").unwrap();
        assert_eq!(uri.path(), "some%20file");
        assert_eq!(uri.name(), "some%20file");
        assert_eq!(uri.display_name(), "some file");
        assert_eq!(uri.to_string(), "s3://b/some%20file");
    }

    #[test]
    fn dot_dot_cannot_escape_root() {
        let uri = ObjectUri::parse("s3://b/../../x").unwrap();
        assert_eq!(uri.path(), "x");
    }

    #[test]
    fn local_path_is_absolute() {
        let uri = ObjectUri::parse("file:///tmp/dir/f.bin").unwrap();
        assert_eq!(uri.local_path(), Utf8PathBuf::from("/tmp/dir/f.bin"));
    }
}
