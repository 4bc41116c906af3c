use std::fmt;
use std::str::FromStr;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("Code bundle {bundle_id:?} has no blocks")]
    MissingBlocks { bundle_id: String },
    #[error("Code bundle {bundle_id:?} references unknown code ref {code_ref}")]
    UnknownRef { bundle_id: String, code_ref: u64 },
    #[error("Code bundle {bundle_id:?} has an empty checksum for code ref {code_ref}")]
    EmptyChecksum { bundle_id: String, code_ref: u64 },
    #[error("Invalid engine version {0:?}")]
    InvalidVersion(String),
}

pub type CodeResult<T> = std::result::Result<T, CodeError>;

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoints: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datapoints: Vec<u64>,
}

/// A compiled query. Only the parts the graph needs are modelled: the
/// stable id, the checksum table and the refs of the first block.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct CodeBundle {
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_engine_version: Option<String>,
    #[serde(default)]
    pub checksums: HashMap<u64, String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl CodeBundle {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yml::from_str(yaml)?)
    }

    pub fn entrypoint_checksums(&self) -> CodeResult<Vec<String>> {
        let block = self.first_block()?;
        self.resolve_refs(&block.entrypoints)
    }

    pub fn datapoint_checksums(&self) -> CodeResult<Vec<String>> {
        let block = self.first_block()?;
        self.resolve_refs(&block.datapoints)
    }

    /// Entrypoints followed by datapoints.
    pub fn codepoint_checksums(&self) -> CodeResult<Vec<String>> {
        let mut checksums = self.entrypoint_checksums()?;
        checksums.extend(self.datapoint_checksums()?);
        Ok(checksums)
    }

    /// Whether an engine of `engine_version` may run this bundle. A missing
    /// engine version or an unreadable requirement does not block.
    pub fn can_run_on(&self, engine_version: Option<&EngineVersion>) -> bool {
        let (Some(engine_version), Some(required)) =
            (engine_version, self.min_engine_version.as_deref())
        else {
            return true;
        };

        match required.parse::<EngineVersion>() {
            Ok(required) => *engine_version >= required,
            Err(err) => {
                tracing::warn!(bundle_id = %self.id, %err, "ignoring unreadable version requirement");
                true
            }
        }
    }

    fn first_block(&self) -> CodeResult<&Block> {
        self.blocks.first().ok_or_else(|| CodeError::MissingBlocks {
            bundle_id: self.id.clone(),
        })
    }

    fn resolve_refs(&self, refs: &[u64]) -> CodeResult<Vec<String>> {
        refs.iter()
            .map(|code_ref| match self.checksums.get(code_ref) {
                None => Err(CodeError::UnknownRef {
                    bundle_id: self.id.clone(),
                    code_ref: *code_ref,
                }),
                Some(checksum) if checksum.is_empty() => Err(CodeError::EmptyChecksum {
                    bundle_id: self.id.clone(),
                    code_ref: *code_ref,
                }),
                Some(checksum) => Ok(checksum.clone()),
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl EngineVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for EngineVersion {
    type Err = CodeError;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        let invalid = || CodeError::InvalidVersion(version.to_string());

        let trimmed = version.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        // pre-release and build metadata do not take part in the comparison
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u64, CodeError> {
            match parts.next() {
                Some(part) => part.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE_YAML: &str = r#"
id: query-a
source: "sshd.config.params['PermitRootLogin'] == 'no'"
checksums:
  1: "chk-entry"
  2: "chk-data"
blocks:
  - entrypoints: [1]
    datapoints: [2]
"#;

    #[test]
    fn checksums_from_yaml() -> anyhow::Result<()> {
        let bundle = CodeBundle::from_yaml(BUNDLE_YAML)?;

        assert_eq!(bundle.entrypoint_checksums()?, vec!["chk-entry"]);
        assert_eq!(bundle.datapoint_checksums()?, vec!["chk-data"]);
        assert_eq!(bundle.codepoint_checksums()?, vec!["chk-entry", "chk-data"]);

        Ok(())
    }

    #[test]
    fn malformed_bundles_are_rejected() {
        let empty = CodeBundle {
            id: "empty".to_string(),
            ..Default::default()
        };
        assert_eq!(
            empty.entrypoint_checksums(),
            Err(CodeError::MissingBlocks {
                bundle_id: "empty".to_string()
            })
        );

        let mut dangling = CodeBundle {
            id: "dangling".to_string(),
            blocks: vec![Block {
                entrypoints: vec![7],
                datapoints: vec![],
            }],
            ..Default::default()
        };
        assert!(matches!(
            dangling.codepoint_checksums(),
            Err(CodeError::UnknownRef { code_ref: 7, .. })
        ));

        dangling.checksums.insert(7, String::new());
        assert!(matches!(
            dangling.codepoint_checksums(),
            Err(CodeError::EmptyChecksum { code_ref: 7, .. })
        ));
    }

    #[test]
    fn parses_engine_versions() {
        assert_eq!("9.1.2".parse(), Ok(EngineVersion::new(9, 1, 2)));
        assert_eq!("v10".parse(), Ok(EngineVersion::new(10, 0, 0)));
        assert_eq!("11.2.0-rc1+build5".parse(), Ok(EngineVersion::new(11, 2, 0)));
        assert!("unstable".parse::<EngineVersion>().is_err());
        assert!("1.2.3.4".parse::<EngineVersion>().is_err());
        assert!("".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn version_gate() {
        let bundle = CodeBundle {
            id: "gated".to_string(),
            min_engine_version: Some("9.2.0".to_string()),
            ..Default::default()
        };

        assert!(bundle.can_run_on(None));
        assert!(bundle.can_run_on(Some(&EngineVersion::new(9, 2, 0))));
        assert!(bundle.can_run_on(Some(&EngineVersion::new(10, 0, 0))));
        assert!(!bundle.can_run_on(Some(&EngineVersion::new(9, 1, 9))));

        let unreadable = CodeBundle {
            min_engine_version: Some("latest".to_string()),
            ..bundle
        };
        assert!(unreadable.can_run_on(Some(&EngineVersion::new(1, 0, 0))));
    }
}
