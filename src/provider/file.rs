//! Declarative route files: one YAML document per provider, mapping alias to
//! entry attributes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::entry::RawEntry;
use crate::error::{ErrorList, RouteError};

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the whole document. A missing file is an empty route
    /// set (the file was deleted, its routes go away); any other read or
    /// parse failure keeps the previous routes serving.
    pub async fn load(&self) -> (BTreeMap<String, RawEntry>, ErrorList) {
        let path_text = self.path.display().to_string();
        let mut errs = ErrorList::new(format!("route file `{path_text}`"));

        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path_text, "route file absent, no routes");
                return (BTreeMap::new(), errs);
            }
            Err(err) => {
                errs.push(RouteError::connection(path_text, err));
                return (BTreeMap::new(), errs);
            }
        };

        match parse_document(&text, &path_text) {
            Ok(entries) => (entries, errs),
            Err(err) => {
                errs.push(err);
                (BTreeMap::new(), errs)
            }
        }
    }
}

fn parse_document(text: &str, path: &str) -> Result<BTreeMap<String, RawEntry>, RouteError> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut entries: BTreeMap<String, RawEntry> =
        serde_yaml::from_str(text).map_err(|err| RouteError::InvalidDocument {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
    for (alias, entry) in &mut entries {
        if alias.is_empty() {
            return Err(RouteError::InvalidDocument {
                path: path.to_string(),
                reason: "empty alias key".to_string(),
            });
        }
        entry.alias = alias.clone();
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let doc = "\
web:
  port: 8080
  scheme: https
api:
  host: 10.0.0.7
  port: \"9000\"
  path_patterns:
    - GET /api
";
        let entries = parse_document(doc, "routes.yml").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["web"].alias, "web");
        assert_eq!(entries["web"].port.as_deref(), Some("8080"));
        assert_eq!(entries["api"].host.as_deref(), Some("10.0.0.7"));
        assert_eq!(entries["api"].path_patterns, vec!["GET /api"]);
    }

    #[test]
    fn test_empty_document_is_no_routes() {
        assert!(parse_document("", "routes.yml").unwrap().is_empty());
        assert!(parse_document("   \n", "routes.yml").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_attribute_is_a_document_error() {
        let doc = "web:\n  bogus: 1\n";
        let err = parse_document(doc, "routes.yml").unwrap_err();
        assert!(matches!(err, RouteError::InvalidDocument { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let source = FileSource::new("/nonexistent/routes.yml");
        let (entries, errs) = source.load().await;
        assert!(entries.is_empty());
        assert!(errs.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_reports_and_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.yml");
        std::fs::write(&path, "web: [not, a, mapping").unwrap();

        let source = FileSource::new(&path);
        let (entries, errs) = source.load().await;
        assert!(entries.is_empty());
        assert_eq!(errs.len(), 1);
    }
}
