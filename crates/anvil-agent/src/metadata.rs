//! Durable per-instance record, `instances/<name>/instance.json`.
//!
//! The record outlives backend resources: a container removed and recreated for a config change
//! gets its ports, RAM and environment overrides back from here. Every mutation reads the
//! current document first so keys the caller did not mention survive, including keys this
//! version does not know about.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anvil_model::{PortBinding, RamValue};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, RuntimeError};
use crate::layout::DataLayout;

pub const METADATA_FILE: &str = "instance.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader_version: Option<String>,
    #[serde(default)]
    pub env_overrides: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "de_opt_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBinding>,
    #[serde(
        default,
        deserialize_with = "de_opt_ram",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_ram_mb: Option<u64>,
    #[serde(
        default,
        deserialize_with = "de_opt_ram",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_ram_mb: Option<u64>,
    /// Requested runtime version (Java major for Minecraft workloads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_java_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub previous_names: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn de_opt_ram<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    let raw = Option::<RamValue>::deserialize(d)?;
    Ok(raw.as_ref().and_then(parse_ram_mb))
}

fn de_opt_port<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u16>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }
    let raw = Option::<Raw>::deserialize(d)?;
    Ok(match raw {
        Some(Raw::Int(v)) => u16::try_from(v).ok().filter(|p| *p != 0),
        Some(Raw::Text(s)) => s.trim().parse::<u16>().ok().filter(|p| *p != 0),
        None => None,
    })
}

/// Merges `overrides` into `target`: new values win, untouched keys survive, and an empty
/// value removes the key.
pub fn merge_env(target: &mut BTreeMap<String, String>, overrides: &BTreeMap<String, String>) {
    for (k, v) in overrides {
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if v.is_empty() {
            target.remove(k);
        } else {
            target.insert(k.to_string(), v.clone());
        }
    }
}

/// Normalises a RAM amount to megabytes. Zero and unparseable values yield `None`.
pub fn parse_ram_mb(value: &RamValue) -> Option<u64> {
    let mb = match value {
        RamValue::Megabytes(v) => *v,
        RamValue::Text(raw) => {
            let s = raw.trim().to_ascii_lowercase();
            let split = s
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(s.len());
            let (num, unit) = s.split_at(split);
            let num: f64 = num.parse().ok()?;
            let factor = match unit.trim() {
                "" | "m" | "mb" | "mib" => 1.0,
                "g" | "gb" | "gib" => 1024.0,
                "t" | "tb" | "tib" => 1024.0 * 1024.0,
                "k" | "kb" | "kib" => 1.0 / 1024.0,
                _ => return None,
            };
            let mb = (num * factor).round();
            if !mb.is_finite() || mb < 0.0 {
                return None;
            }
            mb as u64
        }
    };
    (mb > 0).then_some(mb)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceQuota {
    pub min_ram_mb: u64,
    pub max_ram_mb: u64,
}

impl ResourceQuota {
    /// Parses both bounds, substituting defaults for invalid or zero values rather than failing.
    /// Returns the quota plus a warning per substituted value.
    pub fn resolve(
        min: Option<&RamValue>,
        max: Option<&RamValue>,
        default_min_mb: u64,
        default_max_mb: u64,
    ) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut pick = |label: &str, v: Option<&RamValue>, default: u64| match v {
            None => default,
            Some(raw) => parse_ram_mb(raw).unwrap_or_else(|| {
                warnings.push(format!(
                    "invalid {label} {raw:?}, using default {default}MB"
                ));
                default
            }),
        };
        let max_ram_mb = pick("max_ram", max, default_max_mb);
        let mut min_ram_mb = pick("min_ram", min, default_min_mb.min(max_ram_mb));
        if min_ram_mb > max_ram_mb {
            warnings.push(format!(
                "min_ram {min_ram_mb}MB exceeds max_ram {max_ram_mb}MB, clamping"
            ));
            min_ram_mb = max_ram_mb;
        }
        (
            Self {
                min_ram_mb,
                max_ram_mb,
            },
            warnings,
        )
    }

    pub fn from_metadata(meta: &ServerMetadata, default_min_mb: u64, default_max_mb: u64) -> Self {
        let max_ram_mb = meta.max_ram_mb.unwrap_or(default_max_mb);
        let min_ram_mb = meta
            .min_ram_mb
            .unwrap_or(default_min_mb)
            .min(max_ram_mb);
        Self {
            min_ram_mb,
            max_ram_mb,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    layout: DataLayout,
}

impl MetadataStore {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.layout.instance_dir(name)?.join(METADATA_FILE))
    }

    /// `Ok(None)` when absent. An unreadable document is logged and treated as absent.
    pub async fn load(&self, name: &str) -> Result<Option<ServerMetadata>> {
        let path = self.path(name)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RuntimeError::io(format!("read {}", path.display()))(e)),
        };
        match serde_json::from_slice::<ServerMetadata>(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                tracing::warn!(
                    instance = %name,
                    path = %path.display(),
                    error = %e,
                    "metadata document is corrupt; continuing with defaults"
                );
                Ok(None)
            }
        }
    }

    pub async fn load_or_default(&self, name: &str) -> ServerMetadata {
        match self.load(name).await {
            Ok(Some(m)) => m,
            Ok(None) => ServerMetadata::default(),
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "metadata unreadable");
                ServerMetadata::default()
            }
        }
    }

    pub async fn save(&self, name: &str, meta: &ServerMetadata) -> Result<()> {
        let path = self.path(name)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| RuntimeError::Internal("metadata path has no parent".to_string()))?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(RuntimeError::io(format!("create {}", dir.display())))?;

        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(meta)
            .map_err(|e| RuntimeError::Internal(format!("serialize metadata: {e}")))?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(RuntimeError::io("create metadata temp file"))?;
        f.write_all(&data)
            .await
            .map_err(RuntimeError::io("write metadata temp file"))?;
        f.flush()
            .await
            .map_err(RuntimeError::io("flush metadata temp file"))?;
        drop(f);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(RuntimeError::io("persist metadata"))?;
        Ok(())
    }

    /// Read-modify-write. Callers serialise per instance name; the file itself is not locked.
    pub async fn update<F>(&self, name: &str, f: F) -> Result<ServerMetadata>
    where
        F: FnOnce(&mut ServerMetadata),
    {
        let mut meta = self.load_for_write(name).await?;
        f(&mut meta);
        self.save(name, &meta).await?;
        Ok(meta)
    }

    /// The current document as the base for a write. A corrupt one is set aside first.
    pub async fn load_for_write(&self, name: &str) -> Result<ServerMetadata> {
        match self.load(name).await? {
            Some(m) => Ok(m),
            None => {
                self.set_aside_corrupt(name).await?;
                Ok(ServerMetadata::default())
            }
        }
    }

    /// Moves an unparseable `instance.json` to `instance.json.corrupt` so a write of defaults
    /// never destroys it. No-op when the document is absent.
    async fn set_aside_corrupt(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        if tokio::fs::symlink_metadata(&path).await.is_err() {
            return Ok(());
        }
        let aside = path.with_extension("json.corrupt");
        tokio::fs::rename(&path, &aside)
            .await
            .map_err(RuntimeError::io(format!("set aside {}", path.display())))?;
        tracing::warn!(
            instance = %name,
            path = %aside.display(),
            "corrupt metadata document set aside; stored settings must be restored by hand"
        );
        Ok(())
    }

    pub async fn merge_env_overrides(
        &self,
        name: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ServerMetadata> {
        self.update(name, |m| merge_env(&mut m.env_overrides, overrides))
            .await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::io(format!("remove {}", path.display()))(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::test_support::temp_dir_for;

    #[test]
    fn parse_ram_accepts_mixed_forms() {
        assert_eq!(parse_ram_mb(&RamValue::Megabytes(2048)), Some(2048));
        assert_eq!(parse_ram_mb(&RamValue::Text("2G".into())), Some(2048));
        assert_eq!(parse_ram_mb(&RamValue::Text("2048".into())), Some(2048));
        assert_eq!(parse_ram_mb(&RamValue::Text(" 1.5g ".into())), Some(1536));
        assert_eq!(parse_ram_mb(&RamValue::Text("512MiB".into())), Some(512));
        assert_eq!(parse_ram_mb(&RamValue::Text("0".into())), None);
        assert_eq!(parse_ram_mb(&RamValue::Text("lots".into())), None);
        assert_eq!(parse_ram_mb(&RamValue::Megabytes(0)), None);
    }

    #[test]
    fn quota_falls_back_to_defaults() {
        let (q, warnings) = ResourceQuota::resolve(
            Some(&RamValue::Text("bogus".into())),
            Some(&RamValue::Text("4G".into())),
            1024,
            2048,
        );
        assert_eq!(q.min_ram_mb, 1024);
        assert_eq!(q.max_ram_mb, 4096);
        assert_eq!(warnings.len(), 1);

        let (q, _) = ResourceQuota::resolve(
            Some(&RamValue::Megabytes(8192)),
            Some(&RamValue::Megabytes(0)),
            1024,
            2048,
        );
        assert_eq!(q.max_ram_mb, 2048);
        assert_eq!(q.min_ram_mb, 2048);
    }

    #[test]
    fn merge_env_preserves_untouched_keys() {
        let mut env = BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ]);
        let overrides = BTreeMap::from([
            ("B".to_string(), "20".to_string()),
            ("C".to_string(), "3".to_string()),
            ("A".to_string(), String::new()),
        ]);
        merge_env(&mut env, &overrides);
        assert_eq!(env.get("A"), None);
        assert_eq!(env.get("B").map(String::as_str), Some("20"));
        assert_eq!(env.get("C").map(String::as_str), Some("3"));
    }

    #[test]
    fn legacy_document_with_string_fields_parses() {
        let raw = r#"{
            "version": "1.20.4",
            "host_port": "25570",
            "max_ram_mb": "4G",
            "min_ram_mb": 0,
            "panel_owner": "ops"
        }"#;
        let meta: ServerMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.host_port, Some(25570));
        assert_eq!(meta.max_ram_mb, Some(4096));
        assert_eq!(meta.min_ram_mb, None);
        assert!(meta.env_overrides.is_empty());
        assert_eq!(
            meta.extra.get("panel_owner"),
            Some(&serde_json::Value::String("ops".to_string()))
        );
    }

    #[tokio::test]
    async fn update_reads_before_merge_and_keeps_unknown_keys() {
        let root = temp_dir_for("metadata-update");
        let store = MetadataStore::new(DataLayout::new(&root));
        let path = store.path("mc").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            br#"{"env_overrides":{"MOTD":"hi"},"max_ram_mb":2048,"panel_owner":"ops"}"#,
        )
        .unwrap();

        let overrides = BTreeMap::from([("JAVA_VERSION".to_string(), "21".to_string())]);
        let meta = store.merge_env_overrides("mc", &overrides).await.unwrap();
        assert_eq!(meta.env_overrides.len(), 2);

        let reloaded = store.load("mc").await.unwrap().unwrap();
        assert_eq!(reloaded.max_ram_mb, Some(2048));
        assert_eq!(reloaded.env_overrides.get("MOTD").map(String::as_str), Some("hi"));
        assert!(reloaded.extra.contains_key("panel_owner"));
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn absent_and_corrupt_documents_load_as_none() {
        let root = temp_dir_for("metadata-absent");
        let store = MetadataStore::new(DataLayout::new(&root));
        assert!(store.load("nope").await.unwrap().is_none());

        let path = store.path("bad").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();
        assert!(store.load("bad").await.unwrap().is_none());
        assert_eq!(store.load_or_default("bad").await, ServerMetadata::default());
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn update_sets_corrupt_document_aside_before_writing() {
        let root = temp_dir_for("metadata-corrupt-update");
        let store = MetadataStore::new(DataLayout::new(&root));
        let path = store.path("mc").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"env_overrides\": {\"MOTD\": ").unwrap();

        let meta = store
            .update("mc", |m| m.custom_args = Some("-Dfoo".into()))
            .await
            .unwrap();
        assert_eq!(meta.custom_args.as_deref(), Some("-Dfoo"));

        let aside = path.with_extension("json.corrupt");
        assert_eq!(
            std::fs::read(&aside).unwrap(),
            b"{\"env_overrides\": {\"MOTD\": ".to_vec()
        );
        let reloaded = store.load("mc").await.unwrap().unwrap();
        assert_eq!(reloaded.custom_args.as_deref(), Some("-Dfoo"));
        std::fs::remove_dir_all(root).ok();
    }
}
