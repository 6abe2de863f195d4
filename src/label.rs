// src/label.rs

//! Labels and label paths
//!
//! A label names a line of development in a repository using the format
//! `host@namespace:tag`, for example `conary.example.com@rpl:2`. Labels are
//! the branch nodes of a [`Version`](crate::version::Version).
//!
//! Inside a version string a label may be abbreviated relative to the label
//! before it: `tag` reuses the previous host and namespace, `namespace:tag`
//! reuses the previous host.
//!
//! A [`LabelPath`] is an ordered list of labels. The installation engine
//! uses it as the file-priority path: when two troves want the same path,
//! the one from the label that appears earlier wins silently.

use std::fmt;
use std::str::FromStr;

/// Host and namespace of the synthetic labels used for local-only versions
pub const LOCAL_HOST: &str = "local";
pub const LOCAL_NAMESPACE: &str = "local";

/// A label identifying a line of development
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    /// Repository hostname
    pub host: String,
    /// Namespace within the repository
    pub namespace: String,
    /// Branch tag
    pub tag: String,
}

impl Label {
    /// Create a new label
    pub fn new(host: impl Into<String>, namespace: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            tag: tag.into(),
        }
    }

    /// `local@local:LOCAL`, the branch of locally modified troves
    pub fn local() -> Self {
        Self::new(LOCAL_HOST, LOCAL_NAMESPACE, "LOCAL")
    }

    /// `local@local:ROLLBACK`, the branch of troves synthesized for rollbacks
    pub fn rollback() -> Self {
        Self::new(LOCAL_HOST, LOCAL_NAMESPACE, "ROLLBACK")
    }

    /// `local@local:PHANTOM`, the branch of troves mirroring foreign packages
    pub fn phantom() -> Self {
        Self::new(LOCAL_HOST, LOCAL_NAMESPACE, "PHANTOM")
    }

    /// Whether this is one of the `local@local:*` labels
    pub fn is_local(&self) -> bool {
        self.host == LOCAL_HOST && self.namespace == LOCAL_NAMESPACE
    }

    /// Parse a fully qualified label `host@namespace:tag`
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        Self::parse_with_template(s, None)
    }

    /// Parse a label that may be abbreviated relative to `template`
    pub fn parse_with_template(s: &str, template: Option<&Label>) -> Result<Self, LabelParseError> {
        if s.contains('/') {
            return Err(LabelParseError::Slash(s.to_string()));
        }
        let colons = s.matches(':').count();
        let ats = s.matches('@').count();
        if colons > 1 {
            return Err(LabelParseError::UnexpectedColon(s.to_string()));
        }
        if ats > 1 || (ats == 1 && colons == 0) {
            return Err(LabelParseError::UnexpectedAt(s.to_string()));
        }

        let (host, namespace, tag) = match (s.find('@'), s.find(':')) {
            (Some(at), Some(colon)) => {
                if at > colon {
                    return Err(LabelParseError::UnexpectedAt(s.to_string()));
                }
                (&s[..at], &s[at + 1..colon], &s[colon + 1..])
            }
            (None, Some(colon)) => {
                let template = template.ok_or_else(|| LabelParseError::MissingAt(s.to_string()))?;
                (template.host.as_str(), &s[..colon], &s[colon + 1..])
            }
            _ => {
                let template =
                    template.ok_or_else(|| LabelParseError::MissingColon(s.to_string()))?;
                (template.host.as_str(), template.namespace.as_str(), s)
            }
        };

        if host.is_empty() {
            return Err(LabelParseError::EmptyHost(s.to_string()));
        }
        if namespace.is_empty() {
            return Err(LabelParseError::EmptyNamespace(s.to_string()));
        }
        if tag.is_empty() {
            return Err(LabelParseError::EmptyTag(s.to_string()));
        }

        let valid_chars = |c: char| c.is_alphanumeric() || c == '.' || c == '-' || c == '_';
        if !host.chars().all(valid_chars) {
            return Err(LabelParseError::InvalidHost(host.to_string()));
        }
        if !namespace.chars().all(valid_chars) {
            return Err(LabelParseError::InvalidNamespace(namespace.to_string()));
        }
        if !tag.chars().all(valid_chars) {
            return Err(LabelParseError::InvalidTag(tag.to_string()));
        }

        Ok(Self::new(host, namespace, tag))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.host, self.namespace, self.tag)
    }
}

impl FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::parse(s)
    }
}

/// Errors that can occur when parsing a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelParseError {
    /// Labels never contain `/`
    Slash(String),
    /// More than one `:`
    UnexpectedColon(String),
    /// Misplaced or repeated `@`
    UnexpectedAt(String),
    /// Abbreviated label with no previous label to borrow the host from
    MissingAt(String),
    /// Bare tag with no previous label to borrow from
    MissingColon(String),
    EmptyHost(String),
    EmptyNamespace(String),
    EmptyTag(String),
    InvalidHost(String),
    InvalidNamespace(String),
    InvalidTag(String),
}

impl fmt::Display for LabelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelParseError::Slash(s) => write!(f, "'/' should not appear in a label: {}", s),
            LabelParseError::UnexpectedColon(s) => write!(f, "unexpected colon in label: {}", s),
            LabelParseError::UnexpectedAt(s) => write!(f, "unexpected '@' in label: {}", s),
            LabelParseError::MissingAt(s) => write!(f, "'@' expected before label namespace: {}", s),
            LabelParseError::MissingColon(s) => write!(f, "colon expected before branch name: {}", s),
            LabelParseError::EmptyHost(s) => write!(f, "empty host in label: {}", s),
            LabelParseError::EmptyNamespace(s) => write!(f, "namespace may not be empty: {}", s),
            LabelParseError::EmptyTag(s) => write!(f, "branch tag may not be empty: {}", s),
            LabelParseError::InvalidHost(s) => write!(f, "invalid host name: {}", s),
            LabelParseError::InvalidNamespace(s) => write!(f, "invalid namespace: {}", s),
            LabelParseError::InvalidTag(s) => write!(f, "invalid tag: {}", s),
        }
    }
}

impl std::error::Error for LabelParseError {}

impl From<LabelParseError> for crate::Error {
    fn from(e: LabelParseError) -> Self {
        crate::Error::ParseError(e.to_string())
    }
}

/// An ordered label list; earlier labels have higher priority
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPath {
    labels: Vec<Label>,
}

impl LabelPath {
    /// Create a new empty label path
    pub fn new() -> Self {
        Self { labels: Vec::new() }
    }

    /// Create a label path from a list of labels
    pub fn from_labels(labels: Vec<Label>) -> Self {
        Self { labels }
    }

    /// Add a label to the end of the path (lowest priority)
    pub fn push(&mut self, label: Label) {
        self.labels.push(label);
    }

    /// Get the labels in order
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Get the priority of a label (0 = highest, None = not found)
    pub fn priority(&self, label: &Label) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Whether `challenger` outranks `incumbent`
    ///
    /// Both labels must be on the path; a label that is not listed never
    /// wins.
    pub fn outranks(&self, challenger: &Label, incumbent: &Label) -> bool {
        match (self.priority(challenger), self.priority(incumbent)) {
            (Some(c), Some(i)) => c < i,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Parse a whitespace-separated list of labels
    ///
    /// Example: `repo1@ns:tag1 repo2@ns:tag2`
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        let labels = s
            .split_whitespace()
            .map(Label::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { labels })
    }
}

impl fmt::Display for LabelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.labels.iter().map(|l| l.to_string()).collect();
        write!(f, "{}", labels.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parse() {
        let label = Label::parse("conary.example.com@rpl:2").unwrap();
        assert_eq!(label.host, "conary.example.com");
        assert_eq!(label.namespace, "rpl");
        assert_eq!(label.tag, "2");
        assert_eq!(label.to_string(), "conary.example.com@rpl:2");
    }

    #[test]
    fn test_label_parse_errors() {
        assert!(Label::parse("missing-at").is_err());
        assert!(Label::parse("repo@missing-colon").is_err());
        assert!(Label::parse("@ns:tag").is_err());
        assert!(Label::parse("repo@:tag").is_err());
        assert!(Label::parse("repo@ns:").is_err());
        assert!(Label::parse("a/b@ns:tag").is_err());
        assert!(Label::parse("a:b@ns").is_err());
    }

    #[test]
    fn test_abbreviated_labels() {
        let base = Label::parse("host@ns:1").unwrap();
        let tag_only = Label::parse_with_template("devel", Some(&base)).unwrap();
        assert_eq!(tag_only, Label::new("host", "ns", "devel"));

        let ns_tag = Label::parse_with_template("other:2", Some(&base)).unwrap();
        assert_eq!(ns_tag, Label::new("host", "other", "2"));

        assert!(Label::parse_with_template("devel", None).is_err());
    }

    #[test]
    fn test_local_labels() {
        assert_eq!(Label::local().to_string(), "local@local:LOCAL");
        assert!(Label::rollback().is_local());
        assert!(!Label::parse("repo@ns:1").unwrap().is_local());
    }

    #[test]
    fn test_label_path_priority() {
        let path = LabelPath::parse("repo1@ns:1 repo2@ns:2").unwrap();
        let first = Label::parse("repo1@ns:1").unwrap();
        let second = Label::parse("repo2@ns:2").unwrap();
        let other = Label::parse("repo3@ns:3").unwrap();

        assert_eq!(path.len(), 2);
        assert_eq!(path.priority(&second), Some(1));
        assert!(path.outranks(&first, &second));
        assert!(!path.outranks(&second, &first));
        assert!(!path.outranks(&other, &first));
        assert_eq!(path.to_string(), "repo1@ns:1 repo2@ns:2");
    }
}
