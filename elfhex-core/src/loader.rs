//! Source file resolution for include traversal.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::error::CoreError;

/// Maps an include path to file contents plus a canonical path. The canonical
/// path identifies a file regardless of which include spelling reached it, so
/// the preprocessor can skip files it has already merged.
pub trait FileResolver {
    fn resolve(&self, path: &str) -> Result<(String, PathBuf), CoreError>;
}

/// Searches a list of directories for source files, first match wins.
/// Results are cached per request path so include traversal reads each file
/// once.
pub struct FileLoader {
    search_dirs: Vec<PathBuf>,
    cache: RefCell<HashMap<String, (String, PathBuf)>>,
}

impl FileLoader {
    pub fn new<P: Into<PathBuf>>(search_dirs: impl IntoIterator<Item = P>) -> FileLoader {
        FileLoader {
            search_dirs: search_dirs.into_iter().map(Into::into).collect(),
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl FileResolver for FileLoader {
    fn resolve(&self, path: &str) -> Result<(String, PathBuf), CoreError> {
        if let Some(hit) = self.cache.borrow().get(path) {
            return Ok(hit.clone());
        }
        for dir in &self.search_dirs {
            let full = dir.join(path);
            let Ok(contents) = fs::read_to_string(&full) else {
                continue;
            };
            let canonical = fs::canonicalize(&full).unwrap_or(full);
            self.cache
                .borrow_mut()
                .insert(path.to_string(), (contents.clone(), canonical.clone()));
            return Ok((contents, canonical));
        }
        Err(CoreError::FileNotFound {
            path: path.to_string(),
            searched: self.search_dirs.clone(),
        })
    }
}

/// In-memory sources, for tests and for embedding the pipeline without a
/// filesystem. The key doubles as the canonical path.
impl FileResolver for HashMap<String, String> {
    fn resolve(&self, path: &str) -> Result<(String, PathBuf), CoreError> {
        match self.get(path) {
            Some(contents) => Ok((contents.clone(), PathBuf::from(path))),
            None => Err(CoreError::FileNotFound {
                path: path.to_string(),
                searched: Vec::new(),
            }),
        }
    }
}
