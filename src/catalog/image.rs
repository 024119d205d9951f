use serde::{Deserialize, Serialize};

use crate::catalog::CatalogError;

/// A runnable container image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// `registry/repository` path as given in the artifact URI.
    pub name: String,
    pub tag: Option<String>,
    /// Content ID pinned via `?id=`.
    pub id: Option<String>,
}

impl ImageRef {
    /// Parse a `docker://[registry/]repo[:tag][?id=<id>]` artifact URI.
    pub fn parse(uri: &str) -> Result<Self, CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidImage {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let rest = uri
            .strip_prefix("docker://")
            .ok_or_else(|| invalid("unsupported scheme"))?;
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(invalid("missing repository"));
        }
        if !path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:".contains(c))
        {
            return Err(invalid("invalid character in repository"));
        }

        // A colon after the last slash is a tag; earlier ones are registry ports.
        let last_segment = path.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match path[last_segment..].rfind(':') {
            Some(i) => {
                let split = last_segment + i;
                (&path[..split], Some(&path[split + 1..]))
            }
            None => (path, None),
        };
        if name.is_empty() || name.ends_with('/') || tag == Some("") {
            return Err(invalid("malformed repository"));
        }

        let mut id = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("id", value)) if !value.is_empty() => id = Some(value.to_string()),
                Some(("id", _)) => return Err(invalid("empty image id")),
                _ => {}
            }
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.map(str::to_string),
            id,
        })
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(id) = &self.id {
            write!(f, "@{}", id)?;
        }
        Ok(())
    }
}
