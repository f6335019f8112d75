//! Java launch resolution for locally run Minecraft servers.

use std::path::{Path, PathBuf};

use crate::error::{Result, RuntimeError};
use crate::metadata::ResourceQuota;

pub const JVM_ARGS_FILE: &str = "anvil_jvm_args.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub kind: &'static str,
}

fn jvm_flags(quota: ResourceQuota, custom_args: Option<&str>) -> Vec<String> {
    let mut out = vec![
        format!("-Xms{}M", quota.min_ram_mb.max(64)),
        format!("-Xmx{}M", quota.max_ram_mb.max(256)),
    ];
    if let Some(extra) = custom_args {
        out.extend(extra.split_whitespace().map(str::to_string));
    }
    out
}

fn write_jvm_args(instance_dir: &Path, flags: &[String]) -> Result<PathBuf> {
    let path = instance_dir.join(JVM_ARGS_FILE);
    let tmp = instance_dir.join(format!("{JVM_ARGS_FILE}.tmp"));
    let mut out = flags.join("\n");
    out.push('\n');
    std::fs::write(&tmp, out.as_bytes()).map_err(RuntimeError::io("write jvm args"))?;
    std::fs::rename(&tmp, &path).map_err(RuntimeError::io("persist jvm args"))?;
    Ok(path)
}

fn collect_named_files(root: &Path, file_name: &str, out: &mut Vec<PathBuf>) {
    let rd = match std::fs::read_dir(root) {
        Ok(v) => v,
        Err(_) => return,
    };
    for e in rd.flatten() {
        let path = e.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            collect_named_files(&path, file_name, out);
            continue;
        }
        if meta.is_file()
            && path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|n| n == file_name)
        {
            out.push(path);
        }
    }
}

/// Shallowest match wins, ties broken lexically.
fn best_candidate(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by(|a, b| {
        let la = a.components().count();
        let lb = b.components().count();
        la.cmp(&lb)
            .then_with(|| a.to_string_lossy().cmp(&b.to_string_lossy()))
    });
    candidates.into_iter().next()
}

fn find_unix_args(instance_dir: &Path) -> Option<PathBuf> {
    let mut out = Vec::<PathBuf>::new();
    let libs = instance_dir.join("libraries");
    if libs.is_dir() {
        collect_named_files(&libs, "unix_args.txt", &mut out);
    }
    if out.is_empty() {
        collect_named_files(instance_dir, "unix_args.txt", &mut out);
    }
    best_candidate(out)
}

fn to_rel_arg(base: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| RuntimeError::Internal("args file is outside the instance dir".to_string()))?;
    Ok(format!("@{}", rel.to_string_lossy()))
}

/// `server.jar` launches directly; Forge/NeoForge packs launch through their
/// `libraries/**/unix_args.txt` plus a generated JVM args file.
pub fn resolve_launch_spec(
    instance_dir: &Path,
    java: &str,
    quota: ResourceQuota,
    custom_args: Option<&str>,
) -> Result<LaunchSpec> {
    let flags = jvm_flags(quota, custom_args);

    if instance_dir.join("server.jar").is_file() {
        let mut args = flags;
        args.extend(["-jar", "server.jar", "nogui"].map(str::to_string));
        return Ok(LaunchSpec {
            exec: java.to_string(),
            args,
            kind: "jar",
        });
    }

    if let Some(unix_args) = find_unix_args(instance_dir) {
        let user_jvm = instance_dir.join("user_jvm_args.txt");
        let generated = write_jvm_args(instance_dir, &flags)?;

        let mut args = Vec::<String>::new();
        if user_jvm.is_file() {
            args.push(to_rel_arg(instance_dir, &user_jvm)?);
        }
        args.push(to_rel_arg(instance_dir, &generated)?);
        args.push(to_rel_arg(instance_dir, &unix_args)?);
        args.push("nogui".to_string());
        return Ok(LaunchSpec {
            exec: java.to_string(),
            args,
            kind: "args-file",
        });
    }

    Err(RuntimeError::invalid(
        "instance",
        "could not determine how to launch this server (expected server.jar or libraries/**/unix_args.txt)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::test_support::temp_dir_for;

    const QUOTA: ResourceQuota = ResourceQuota {
        min_ram_mb: 1024,
        max_ram_mb: 4096,
    };

    #[test]
    fn server_jar_launches_directly() {
        let dir = temp_dir_for("launch-jar");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("server.jar"), b"").unwrap();
        let spec = resolve_launch_spec(&dir, "/opt/java21/bin/java", QUOTA, Some("-XX:+UseG1GC")).unwrap();
        assert_eq!(spec.exec, "/opt/java21/bin/java");
        assert_eq!(
            spec.args,
            vec!["-Xms1024M", "-Xmx4096M", "-XX:+UseG1GC", "-jar", "server.jar", "nogui"]
        );
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn forge_pack_uses_args_files() {
        let dir = temp_dir_for("launch-forge");
        let nested = dir.join("libraries/net/minecraftforge/forge/1.20.1-47.2.0");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("unix_args.txt"), b"-cp x").unwrap();
        std::fs::write(dir.join("user_jvm_args.txt"), b"").unwrap();

        let spec = resolve_launch_spec(&dir, "java", QUOTA, None).unwrap();
        assert_eq!(spec.kind, "args-file");
        assert_eq!(spec.args[0], "@user_jvm_args.txt");
        assert_eq!(spec.args[1], format!("@{JVM_ARGS_FILE}"));
        assert!(spec.args[2].ends_with("unix_args.txt"));
        let generated = std::fs::read_to_string(dir.join(JVM_ARGS_FILE)).unwrap();
        assert_eq!(generated, "-Xms1024M\n-Xmx4096M\n");
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn empty_dir_is_rejected() {
        let dir = temp_dir_for("launch-empty");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(resolve_launch_spec(&dir, "java", QUOTA, None).is_err());
        std::fs::remove_dir_all(dir).ok();
    }
}
