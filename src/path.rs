use std::fmt;

/// A node/context identifier scoping a family of paths.
///
/// Transactions are opened against one node; relative paths are resolved
/// against it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Result<Self, PathError> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(is_segment_char) {
            return Err(PathError::InvalidNode(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A hierarchical, slash-delimited symbolic name, optionally carrying a node
/// qualifier, e.g. `alpha:/users/42/avatar` or `/users/42/avatar`.
///
/// A trailing `*` segment makes the path a wildcard, usable for bulk listing
/// only; mutating operations reject wildcards. Two paths are equal iff their
/// fully-qualified (node-resolved) form is equal, so equality of relative
/// paths is only meaningful once qualified.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ResourcePath {
    node: Option<NodeId>,
    segments: Vec<String>,
    wildcard: bool,
}

/// Errors arising from path parsing and validation.
#[derive(Debug, PartialEq, Eq)]
pub enum PathError {
    Empty,
    InvalidNode(String),
    InvalidSegment(String),
    /// `*` may only appear as the final segment.
    WildcardPosition,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty path"),
            Self::InvalidNode(node) => write!(f, "invalid node identifier: {node:?}"),
            Self::InvalidSegment(seg) => write!(f, "invalid path segment: {seg:?}"),
            Self::WildcardPosition => write!(f, "wildcard must be the final segment"),
        }
    }
}

impl std::error::Error for PathError {}

const WILDCARD: &str = "*";

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '~' | '@' | '+')
}

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || !segment.chars().all(is_segment_char)
    {
        return Err(PathError::InvalidSegment(segment.to_owned()));
    }
    Ok(())
}

impl ResourcePath {
    /// Parses `[node:]/seg/seg[/*]`.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        if input.is_empty() {
            return Err(PathError::Empty);
        }

        let (node, rest) = match input.split_once(':') {
            Some((node, rest)) => (Some(NodeId::new(node)?), rest),
            None => (None, input),
        };

        let rest = rest.strip_prefix('/').ok_or(PathError::Empty)?;
        let mut segments = Vec::new();
        let mut wildcard = false;
        if !rest.is_empty() {
            let raw: Vec<&str> = rest.split('/').collect();
            for (i, segment) in raw.iter().enumerate() {
                if *segment == WILDCARD {
                    if i + 1 != raw.len() {
                        return Err(PathError::WildcardPosition);
                    }
                    wildcard = true;
                } else {
                    validate_segment(segment)?;
                    segments.push((*segment).to_owned());
                }
            }
        }

        Ok(Self { node, segments, wildcard })
    }

    /// The root path of a node.
    pub fn root(node: Option<NodeId>) -> Self {
        Self { node, segments: Vec::new(), wildcard: false }
    }

    pub fn node(&self) -> Option<&NodeId> {
        self.node.as_ref()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Resolves this path against `default_node`, dropping any wildcard
    /// marker (a wildcard qualifies to the prefix it enumerates under).
    pub fn qualify(&self, default_node: &NodeId) -> QualifiedPath {
        QualifiedPath {
            node: self.node.clone().unwrap_or_else(|| default_node.clone()),
            segments: self.segments.clone(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}:")?;
        }
        if self.segments.is_empty() && !self.wildcard {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        if self.wildcard {
            write!(f, "/{WILDCARD}")?;
        }
        Ok(())
    }
}

impl From<QualifiedPath> for ResourcePath {
    fn from(path: QualifiedPath) -> Self {
        Self { node: Some(path.node), segments: path.segments, wildcard: false }
    }
}

/// A fully-qualified (node-resolved) path. This is the canonical index and
/// lock key: two `ResourcePath`s denote the same location iff they qualify to
/// the same `QualifiedPath`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct QualifiedPath {
    node: NodeId,
    segments: Vec<String>,
}

impl QualifiedPath {
    /// Parses the canonical `node:/seg/seg` form produced by `Display`.
    /// The node qualifier is mandatory here.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let path = ResourcePath::parse(input)?;
        if path.wildcard {
            return Err(PathError::WildcardPosition);
        }
        match path.node {
            Some(node) => Ok(Self { node, segments: path.segments }),
            None => Err(PathError::InvalidNode(input.to_owned())),
        }
    }

    pub fn new(node: NodeId, segments: Vec<String>) -> Result<Self, PathError> {
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { node, segments })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn child(&self, segment: &str) -> Result<Self, PathError> {
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_owned());
        Ok(Self { node: self.node.clone(), segments })
    }

    /// Filesystem directory components for the path index: the node name
    /// followed by every segment. Segment characters are restricted at parse
    /// time, so components are used verbatim as directory names.
    pub fn fs_components(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.node.as_str()).chain(self.segments.iter().map(String::as_str))
    }

    /// Single-component escaped form, used as a directory name in the reverse
    /// path index (`%` becomes `%25`, `/` separators become `%2f`).
    pub fn escaped(&self) -> String {
        self.to_string().replace('%', "%25").replace('/', "%2f")
    }

    /// Inverse of [`escaped`](Self::escaped).
    pub fn unescape(escaped: &str) -> Result<Self, PathError> {
        let raw = escaped.replace("%2f", "/").replace("%25", "%");
        let path = ResourcePath::parse(&raw)?;
        match path.node {
            Some(node) => Ok(Self { node, segments: path.segments }),
            None => Err(PathError::InvalidNode(raw)),
        }
    }
}

impl fmt::Display for QualifiedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.node)?;
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}
