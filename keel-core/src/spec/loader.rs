//! Reading application spec files from a checked-out repository

use serde::Deserialize;
use std::path::Path;

use super::SpecError;
use super::application::ApplicationSpec;
use crate::domain::RawBytes;

/// Kinds accepted at the top of an application spec file
pub const APPLICATION_KINDS: [&str; 6] = [
    "Application",
    "KubernetesApp",
    "TerraformApp",
    "CloudRunApp",
    "LambdaApp",
    "ECSApp",
];

pub fn is_application_kind(kind: &str) -> bool {
    APPLICATION_KINDS.contains(&kind)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecDocument {
    #[serde(default)]
    api_version: String,
    kind: String,
    #[serde(default)]
    spec: Option<ApplicationSpec>,
}

/// A validated spec plus the exact bytes it was parsed from
///
/// Plugins receive `raw` verbatim; the agent only reads `spec`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSpec {
    pub api_version: String,
    pub kind: String,
    pub spec: ApplicationSpec,
    pub raw: RawBytes,
    pub filename: String,
}

/// Parse and validate spec file contents
pub fn parse_application_spec(raw: &[u8], filename: &str) -> Result<LoadedSpec, SpecError> {
    let doc: SpecDocument =
        serde_yaml::from_slice(raw).map_err(|e| SpecError::Parse(format!("{}: {}", filename, e)))?;

    if !is_application_kind(&doc.kind) {
        return Err(SpecError::InvalidKind(doc.kind));
    }

    let spec = doc.spec.unwrap_or_default();
    spec.validate()?;

    Ok(LoadedSpec {
        api_version: doc.api_version,
        kind: doc.kind,
        spec,
        raw: RawBytes(raw.to_vec()),
        filename: filename.to_string(),
    })
}

/// Load the spec at `rel_path` inside `repo_root`
pub fn load_application_spec(repo_root: &Path, rel_path: &str) -> Result<LoadedSpec, SpecError> {
    let abs = repo_root.join(rel_path);
    let raw = std::fs::read(&abs).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SpecError::NotFound(rel_path.to_string())
        } else {
            SpecError::Io {
                path: rel_path.to_string(),
                source: e,
            }
        }
    })?;
    let filename = Path::new(rel_path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| rel_path.to_string());
    parse_application_spec(&raw, &filename)
}
