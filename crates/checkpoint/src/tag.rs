//! Coverage tags.

use std::fmt;

/// The key coverage is recorded under.
///
/// A tag is an ordered list of segments: the `.`-separated parts of a
/// resource URI, optionally followed by an identity. Its persisted form
/// strips every character that is not ASCII alphanumeric from each segment
/// and joins the segments with `.`, so `("Finance.BalanceSheet", "000001.SZ")`
/// is stored as `Finance.BalanceSheet.000001SZ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoverageTag {
    segments: Vec<String>,
}

impl CoverageTag {
    /// Tag for a whole resource, one segment per URI part.
    pub fn resource(uri: &str) -> Self {
        Self {
            segments: uri.split('.').map(str::to_string).collect(),
        }
    }

    /// Tag for one identity of a resource.
    pub fn identity(uri: &str, identity: &str) -> Self {
        Self::resource(uri).with(identity)
    }

    /// Resource tag, or identity tag when `identity` is given.
    pub fn for_request(uri: &str, identity: Option<&str>) -> Self {
        match identity {
            Some(identity) => Self::identity(uri, identity),
            None => Self::resource(uri),
        }
    }

    pub fn with(mut self, segment: &str) -> Self {
        self.segments.push(segment.to_string());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Persisted form of the tag.
    pub fn joined(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.chars().filter(char::is_ascii_alphanumeric).collect::<String>())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for CoverageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}
