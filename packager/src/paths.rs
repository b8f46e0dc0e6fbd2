//! Three distinct nominal path types. Mixing them up is the classic bug
//! source when a build runs on one OS and produces an image meant for
//! another, so each is its own type rather than a bare `String`/`PathBuf`.
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A path on the build host: absolute or relative, using the host's own
/// separator conventions until explicitly converted to image form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostPath(PathBuf);

impl HostPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn join(&self, segment: impl AsRef<Path>) -> Self {
        Self(self.0.join(segment))
    }

    /// Converts to image-form `ImagePath`, normalizing Windows volume
    /// prefixes (`C:\x` becomes `/c/x`) and separators to POSIX form. This
    /// conversion is one-way: there is no meaningful inverse.
    pub fn to_image_path(&self) -> ImagePath {
        let s = self.0.to_string_lossy();
        let mut out = String::new();

        let bytes: Vec<char> = s.chars().collect();
        if bytes.len() >= 2 && bytes[1] == ':' && bytes[0].is_ascii_alphabetic() {
            out.push('/');
            out.push(bytes[0].to_ascii_lowercase());
            let rest: String = bytes[2..].iter().collect();
            out.push_str(&rest.replace('\\', "/"));
        } else {
            out.push_str(&s.replace('\\', "/"));
        }

        if !out.starts_with('/') {
            out = format!("/{out}");
        }

        ImagePath::new(out)
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for HostPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for HostPath {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// An absolute POSIX path inside the produced image. Always uses `/`
/// separators regardless of the host that built the image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImagePath(String);

impl ImagePath {
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path = format!("/{path}");
        }
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, segment: &str) -> Self {
        if self.0.ends_with('/') {
            Self(format!("{}{}", self.0, segment))
        } else {
            Self(format!("{}/{}", self.0, segment))
        }
    }

    /// Returns the chain of parent directories from the root to (but not
    /// including) this path, in top-down order. Used to emit directory
    /// entries for a tar stream without relying on the OS path separator.
    pub fn ancestors(&self) -> Vec<ImagePath> {
        let mut parts: Vec<&str> = self.0.split('/').filter(|s| !s.is_empty()).collect();
        parts.pop();
        let mut out = Vec::with_capacity(parts.len());
        let mut acc = String::new();
        for part in parts {
            acc.push('/');
            acc.push_str(part);
            out.push(ImagePath(acc.clone()));
        }
        out
    }

    /// Substitutes every occurrence of `${ARTIFACT_DIR}` with `artifact_dir`.
    pub fn substitute_artifact_dir(template: &str, artifact_dir: &ImagePath) -> String {
        template.replace("${ARTIFACT_DIR}", artifact_dir.as_str())
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImagePath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ImagePath {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A relative path, used for bundle include/exclude lists. Always compared
/// component-wise so `./a` and `a` are equivalent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelPath(String);

impl RelPath {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let normalized: Vec<&str> = Path::new(&path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        Self(normalized.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `other` is this path or a descendant of it.
    pub fn contains(&self, other: &RelPath) -> bool {
        other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_windows_volume_prefix() {
        let host = HostPath::new("C:\\x\\y");
        assert_eq!(host.to_image_path().as_str(), "/c/x/y");
    }

    #[test]
    fn unix_host_path_passes_through() {
        let host = HostPath::new("/host/artifacts/entrypoint");
        assert_eq!(
            host.to_image_path().as_str(),
            "/host/artifacts/entrypoint"
        );
    }

    #[test]
    fn ancestors_are_top_down() {
        let path = ImagePath::new("/a/b/c");
        assert_eq!(
            path.ancestors(),
            vec![ImagePath::new("/a"), ImagePath::new("/a/b")]
        );
    }

    #[test]
    fn rel_path_normalizes_dot_prefix() {
        assert_eq!(RelPath::new("./a/b"), RelPath::new("a/b"));
    }

    #[test]
    fn rel_path_contains_descendant() {
        let root = RelPath::new("node_modules");
        assert!(root.contains(&RelPath::new("node_modules/foo")));
        assert!(!root.contains(&RelPath::new("node_modules2/foo")));
    }
}
