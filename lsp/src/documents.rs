//! Document routing: selector matching, watched-file filtering, and the set
//! of documents the server currently believes are open.

use std::collections::HashMap;
use std::path::Path;

use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use url::Url;

use crate::endpoint::StartupError;
use crate::types::DocumentFilter;

fn compile_glob(pattern: &str) -> Result<Glob, StartupError> {
    Glob::new(pattern)
        .map_err(|e| StartupError::Config(format!("invalid glob pattern '{pattern}': {e}")))
}

struct CompiledFilter {
    scheme: Option<String>,
    language: Option<String>,
    pattern: Option<GlobMatcher>,
}

impl CompiledFilter {
    fn matches(&self, uri: &Url, path: &Path, language_id: &str) -> bool {
        self.scheme.as_deref().is_none_or(|s| s == uri.scheme())
            && self.language.as_deref().is_none_or(|l| l == language_id)
            && self.pattern.as_ref().is_none_or(|p| p.is_match(path))
    }
}

/// A document selector ready for matching.
pub(crate) struct Selector {
    filters: Vec<CompiledFilter>,
}

impl Selector {
    pub fn new(filters: &[DocumentFilter]) -> Result<Self, StartupError> {
        let filters = filters
            .iter()
            .map(|f| {
                Ok(CompiledFilter {
                    scheme: f.scheme.clone(),
                    language: f.language.clone(),
                    pattern: f
                        .pattern
                        .as_deref()
                        .map(|p| compile_glob(p).map(|g| g.compile_matcher()))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>, StartupError>>()?;
        Ok(Self { filters })
    }

    /// An empty selector accepts every document.
    pub fn matches(&self, uri: &Url, path: &Path, language_id: &str) -> bool {
        self.filters.is_empty()
            || self
                .filters
                .iter()
                .any(|f| f.matches(uri, path, language_id))
    }
}

/// Globs deciding which workspace file events reach the server.
pub(crate) struct WatchFilter {
    set: Option<GlobSet>,
}

impl WatchFilter {
    pub fn new(patterns: &[String]) -> Result<Self, StartupError> {
        if patterns.is_empty() {
            return Ok(Self { set: None });
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(compile_glob(pattern)?);
        }
        let set = builder
            .build()
            .map_err(|e| StartupError::Config(format!("invalid watch patterns: {e}")))?;
        Ok(Self { set: Some(set) })
    }

    /// Matches against the absolute path and, when it lies under `root`, the
    /// root-relative path too.
    pub fn matches(&self, path: &Path, root: &Path) -> bool {
        let Some(set) = &self.set else {
            return false;
        };
        set.is_match(path) || path.strip_prefix(root).is_ok_and(|rel| set.is_match(rel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenDocument {
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

/// Documents sent with `didOpen`, keyed by URI.
#[derive(Default)]
pub(crate) struct OpenDocuments {
    docs: HashMap<String, OpenDocument>,
}

impl OpenDocuments {
    /// Returns `false` if the document was already open.
    pub fn open(&mut self, uri: &str, language_id: &str, text: &str) -> bool {
        if self.docs.contains_key(uri) {
            return false;
        }
        self.docs.insert(
            uri.to_string(),
            OpenDocument {
                language_id: language_id.to_string(),
                version: 1,
                text: text.to_string(),
            },
        );
        true
    }

    /// Store new full text and return the bumped version.
    pub fn change(&mut self, uri: &str, text: &str) -> Option<i32> {
        let doc = self.docs.get_mut(uri)?;
        doc.version += 1;
        doc.text = text.to_string();
        Some(doc.version)
    }

    pub fn close(&mut self, uri: &str) -> bool {
        self.docs.remove(uri).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OpenDocument)> {
        self.docs.iter().map(|(uri, doc)| (uri.as_str(), doc))
    }

    pub fn clear(&mut self) {
        self.docs.clear();
    }
}
