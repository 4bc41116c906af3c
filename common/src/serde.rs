use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::file_format::FileFormat;

pub type Result<T> = anyhow::Result<T>;

pub fn serialize<T: Serialize>(value: &T, format: FileFormat) -> Result<String> {
    let serialized = match format {
        FileFormat::Yaml => serde_yml::to_string(value)?,
        FileFormat::Json => serde_json::to_string_pretty(value)?,
    };
    Ok(serialized)
}

pub fn deserialize<T>(serialized: &[u8], format: FileFormat) -> Result<T>
where
    T: DeserializeOwned + 'static,
{
    let text = std::str::from_utf8(serialized)?;
    match format {
        FileFormat::Yaml => Ok(serde_yml::from_str(text)?),
        FileFormat::Json => Ok(serde_json::from_str(text)?),
    }
}

/// Reads `path`, picking the format from its extension.
pub fn deserialize_file<T>(path: &str) -> Result<T>
where
    T: DeserializeOwned + 'static,
{
    let format = FileFormat::from_file_name(path)?;
    let serialized = std::fs::read(path)?;
    deserialize(&serialized, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn yaml_and_json_agree() -> anyhow::Result<()> {
        let mut value: BTreeMap<String, u64> = BTreeMap::new();
        value.insert("query_timeout_secs".to_string(), 30);

        for format in [FileFormat::Yaml, FileFormat::Json] {
            let serialized = serialize(&value, format)?;
            let restored: BTreeMap<String, u64> = deserialize(serialized.as_bytes(), format)?;
            assert_eq!(restored, value);
        }

        Ok(())
    }

    #[test]
    fn reads_yaml_files() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("common-serde-{}.yaml", std::process::id()));
        std::fs::write(&path, "worker_count: 4\nresult_buffer: 64\n")?;

        let path_str = path.to_string_lossy().to_string();
        let restored: BTreeMap<String, u64> = deserialize_file(&path_str)?;
        std::fs::remove_file(&path)?;

        assert_eq!(restored.get("worker_count"), Some(&4));
        assert_eq!(restored.get("result_buffer"), Some(&64));

        Ok(())
    }

    #[test]
    fn rejects_invalid_utf8() {
        let result: Result<BTreeMap<String, u64>> = deserialize(&[0xff, 0xfe], FileFormat::Yaml);
        assert!(result.is_err());
    }
}
