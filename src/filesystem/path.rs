use std::fmt;

/// Normalized absolute path inside the virtual filesystem
///
/// Stored as a list of segments with no empty, `.` or `..` entries. A `..`
/// at the root stays at the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VPath {
    segments: Vec<String>,
}

impl VPath {
    pub fn root() -> Self {
        VPath::default()
    }

    /// Parse a path, treating it as absolute whether or not it starts with `/`
    pub fn parse(path: &str) -> Self {
        let mut result = VPath::root();
        result.push_str(path);
        result
    }

    /// Resolve `path` against a working directory, the way a shell would
    pub fn resolve(cwd: &str, path: &str) -> Self {
        if path.starts_with('/') {
            VPath::parse(path)
        } else {
            let mut result = VPath::parse(cwd);
            result.push_str(path);
            result
        }
    }

    fn push_str(&mut self, path: &str) {
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    self.segments.pop();
                }
                name => self.segments.push(name.to_string()),
            }
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = VPath::root();
        for segment in segments {
            result.push_str(segment.as_ref());
        }
        result
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<VPath> {
        if self.is_root() {
            None
        } else {
            Some(VPath {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    pub fn join(&self, name: &str) -> VPath {
        let mut result = self.clone();
        result.push_str(name);
        result
    }

    /// Path with the first `depth` segments removed
    pub fn skip(&self, depth: usize) -> VPath {
        VPath {
            segments: self.segments.iter().skip(depth).cloned().collect(),
        }
    }
}

impl fmt::Display for VPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.segments.is_empty() {
            f.write_str("/")
        } else {
            for segment in &self.segments {
                write!(f, "/{}", segment)?;
            }
            Ok(())
        }
    }
}

impl From<&str> for VPath {
    fn from(path: &str) -> Self {
        VPath::parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(VPath::parse("/a//b/./c/").to_string(), "/a/b/c");
        assert_eq!(VPath::parse("/a/../../b").to_string(), "/b");
        assert_eq!(VPath::parse("").to_string(), "/");
        assert!(VPath::parse("/..").is_root());
    }

    #[test]
    fn resolve_against_cwd() {
        assert_eq!(VPath::resolve("/home/user", "notes.txt").to_string(), "/home/user/notes.txt");
        assert_eq!(VPath::resolve("/home/user", "../bin/ls").to_string(), "/home/bin/ls");
        assert_eq!(VPath::resolve("/home/user", "/etc").to_string(), "/etc");
        assert_eq!(VPath::resolve("/", "./x").to_string(), "/x");
    }

    #[test]
    fn parts() {
        let path = VPath::parse("/usr/local/bin");
        assert_eq!(path.len(), 3);
        assert_eq!(path.file_name(), Some("bin"));
        assert_eq!(path.parent().unwrap().to_string(), "/usr/local");
        assert_eq!(path.skip(2).to_string(), "/bin");
        assert_eq!(path.join("sh").to_string(), "/usr/local/bin/sh");
        assert_eq!(VPath::root().parent(), None);
    }
}
