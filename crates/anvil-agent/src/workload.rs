//! Per-game knowledge: shutdown keywords, list commands, default ports and the provisioning
//! environment contract.

use std::collections::BTreeMap;

use anvil_model::{PortRequest, ServerInstance, ServerSpec};

use crate::error::{Result, RuntimeError};
use crate::metadata::{ResourceQuota, ServerMetadata};

pub const LABEL_MANAGED: &str = "anvil.managed";
pub const LABEL_NAME: &str = "anvil.name";
pub const LABEL_GAME: &str = "anvil.game";

pub const ENV_TYPE: &str = "TYPE";
pub const ENV_VERSION: &str = "VERSION";
pub const ENV_LOADER_VERSION: &str = "LOADER_VERSION";
pub const ENV_JAVA_VERSION: &str = "JAVA_VERSION";
pub const ENV_JAVA_VERSION_OVERRIDE: &str = "JAVA_VERSION_OVERRIDE";
pub const ENV_JVM_OPTS: &str = "JVM_OPTS";
pub const ENV_INIT_MEMORY: &str = "INIT_MEMORY";
pub const ENV_MAX_MEMORY: &str = "MAX_MEMORY";
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";
pub const ENV_CUSTOM_ID: &str = "ANVIL_CUSTOM_ID";

/// Loader-specific aliases understood by common server images.
const LOADER_ALIASES: &[(&str, &str)] = &[
    ("forge", "FORGE_VERSION"),
    ("fabric", "FABRIC_LOADER_VERSION"),
    ("neoforge", "NEOFORGE_VERSION"),
    ("quilt", "QUILT_LOADER_VERSION"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameKind {
    Minecraft,
    Terraria,
    Dst,
    Generic,
}

impl GameKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minecraft" | "mc" => GameKind::Minecraft,
            "terraria" => GameKind::Terraria,
            "dst" | "dont_starve_together" => GameKind::Dst,
            _ => GameKind::Generic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameKind::Minecraft => "minecraft",
            GameKind::Terraria => "terraria",
            GameKind::Dst => "dst",
            GameKind::Generic => "generic",
        }
    }

    /// Missing game hints default to Minecraft, the original workload of this agent.
    pub fn of_spec(spec: &ServerSpec) -> Self {
        spec.game
            .as_deref()
            .map(Self::parse)
            .unwrap_or(GameKind::Minecraft)
    }

    pub fn of_instance(inst: &ServerInstance) -> Self {
        inst.label(LABEL_GAME)
            .map(Self::parse)
            .unwrap_or(GameKind::Minecraft)
    }

    pub fn of_metadata(meta: &ServerMetadata) -> Self {
        meta.game
            .as_deref()
            .map(Self::parse)
            .unwrap_or(GameKind::Minecraft)
    }

    pub fn graceful_stop_command(self) -> &'static str {
        match self {
            GameKind::Minecraft | GameKind::Generic => "stop",
            GameKind::Terraria => "exit",
            GameKind::Dst => "c_shutdown(true)",
        }
    }

    pub fn list_command(self) -> Option<&'static str> {
        match self {
            GameKind::Minecraft => Some("list"),
            GameKind::Terraria => Some("playing"),
            GameKind::Dst => Some("c_listallplayers()"),
            GameKind::Generic => None,
        }
    }

    pub fn supports_status_query(self) -> bool {
        matches!(self, GameKind::Minecraft)
    }

    pub fn uses_java(self) -> bool {
        matches!(self, GameKind::Minecraft)
    }

    pub fn save_keywords(self) -> &'static [&'static str] {
        match self {
            GameKind::Minecraft => &[
                "saved the game",
                "saving chunks for level",
                "all chunks are saved",
                "saving players",
            ],
            GameKind::Terraria => &["saving world", "world saved"],
            GameKind::Dst => &["serializing world", "shutting down"],
            GameKind::Generic => &[],
        }
    }

    pub fn default_ports(self) -> Vec<PortRequest> {
        match self {
            GameKind::Minecraft => vec![PortRequest::tcp(25565)],
            GameKind::Terraria => vec![PortRequest::tcp(7777)],
            GameKind::Dst => vec![PortRequest::udp(10999), PortRequest::udp(11000)],
            GameKind::Generic => Vec::new(),
        }
    }
}

pub fn is_save_line(kind: GameKind, line: &str) -> Option<&'static str> {
    let lower = line.to_ascii_lowercase();
    kind.save_keywords()
        .iter()
        .copied()
        .find(|k| lower.contains(k))
}

/// Accepts `21`, `java21`, `java-21`, `1.8`, `17.0.9`.
pub fn parse_java_major(raw: &str) -> Result<u32> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s
        .strip_prefix("java")
        .map(|r| r.trim_start_matches(['-', '_', ' ']))
        .unwrap_or(s.as_str());
    let leading = |p: &str| -> Option<u32> {
        let end = p.find(|c: char| !c.is_ascii_digit()).unwrap_or(p.len());
        p[..end].parse::<u32>().ok()
    };
    let major = if let Some(rest) = s.strip_prefix("1.") {
        leading(rest)
    } else {
        leading(s)
    };
    match major {
        Some(v) if (5..=99).contains(&v) => Ok(v),
        _ => Err(RuntimeError::invalid(
            "java_version",
            format!("unrecognised java version: {raw}"),
        )),
    }
}

/// Parses the first line of `java -version` output.
pub fn parse_java_major_from_version_line(first_line: &str) -> Result<u32> {
    // openjdk version "21.0.2" 2024-01-16
    // java version "1.8.0_402"
    // openjdk 21.0.2 2024-01-16
    let ver = if let Some(quoted) = first_line.split('"').nth(1) {
        quoted
    } else {
        first_line
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .ok_or_else(|| {
                RuntimeError::invalid(
                    "java_version",
                    format!("failed to parse java version output: {first_line}"),
                )
            })?
    };
    parse_java_major(ver).map_err(|_| {
        RuntimeError::invalid("java_version", format!("failed to parse java major from: {ver}"))
    })
}

/// Swaps the tag of images that publish per-Java variants (`itzg/minecraft-server:java21`).
pub fn image_for_java(image: &str, major: u32) -> String {
    let (repo, _tag) = split_image_tag(image);
    if repo.ends_with("itzg/minecraft-server") {
        format!("{repo}:java{major}")
    } else {
        image.to_string()
    }
}

fn split_image_tag(image: &str) -> (&str, Option<&str>) {
    // A ':' after the last '/' is a tag, otherwise it is a registry port.
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => (&image[..i], Some(&image[i + 1..])),
        _ => (image, None),
    }
}

/// Builds the environment injected on provisioning. Overrides from metadata are applied last so
/// they always win over derived values.
pub fn provisioning_env(
    kind: GameKind,
    meta: &ServerMetadata,
    quota: ResourceQuota,
    primary_port: Option<u16>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if kind == GameKind::Minecraft {
        env.insert("EULA".to_string(), "TRUE".to_string());
    }
    if let Some(t) = meta.server_type.as_deref().filter(|v| !v.is_empty()) {
        env.insert(ENV_TYPE.to_string(), t.to_ascii_uppercase());
    }
    if let Some(v) = meta.version.as_deref().filter(|v| !v.is_empty()) {
        env.insert(ENV_VERSION.to_string(), v.to_string());
    }
    if let Some(lv) = meta.loader_version.as_deref().filter(|v| !v.is_empty()) {
        env.insert(ENV_LOADER_VERSION.to_string(), lv.to_string());
        let server_type = meta.server_type.as_deref().unwrap_or("").to_ascii_lowercase();
        if let Some((_, alias)) = LOADER_ALIASES.iter().find(|(t, _)| *t == server_type) {
            env.insert((*alias).to_string(), lv.to_string());
        }
    }
    if let Some(j) = meta.java_version.as_deref().filter(|v| !v.is_empty()) {
        env.insert(ENV_JAVA_VERSION.to_string(), j.to_string());
        env.insert(ENV_JAVA_VERSION_OVERRIDE.to_string(), "true".to_string());
    }
    if let Some(args) = meta.custom_args.as_deref().filter(|v| !v.trim().is_empty()) {
        env.insert(ENV_JVM_OPTS.to_string(), args.trim().to_string());
    }
    if let Some(id) = meta.custom_id.as_deref().filter(|v| !v.is_empty()) {
        env.insert(ENV_CUSTOM_ID.to_string(), id.to_string());
    }
    env.insert(ENV_INIT_MEMORY.to_string(), format!("{}M", quota.min_ram_mb));
    env.insert(ENV_MAX_MEMORY.to_string(), format!("{}M", quota.max_ram_mb));
    if let Some(p) = primary_port {
        env.insert(ENV_SERVER_PORT.to_string(), p.to_string());
    }
    for (k, v) in &meta.env_overrides {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Labels attached to every managed resource.
pub fn managed_labels(
    name: &str,
    kind: GameKind,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = extra.clone();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_NAME.to_string(), name.to_string());
    labels.insert(LABEL_GAME.to_string(), kind.as_str().to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn java_version_lines() {
        assert_eq!(
            parse_java_major_from_version_line("openjdk version \"21.0.2\" 2024-01-16").unwrap(),
            21
        );
        assert_eq!(
            parse_java_major_from_version_line("openjdk 21.0.2 2024-01-16").unwrap(),
            21
        );
        assert_eq!(
            parse_java_major_from_version_line("java version \"1.8.0_402\"").unwrap(),
            8
        );
        let err = parse_java_major_from_version_line("not java").unwrap_err();
        assert!(err.to_string().contains("failed to parse java version output"));
        let err = parse_java_major_from_version_line("openjdk version \"abc\"").unwrap_err();
        assert!(err.to_string().contains("failed to parse java major"));
    }

    #[test]
    fn java_requests() {
        assert_eq!(parse_java_major("21").unwrap(), 21);
        assert_eq!(parse_java_major("java17").unwrap(), 17);
        assert_eq!(parse_java_major("Java-8").unwrap(), 8);
        assert_eq!(parse_java_major("1.8").unwrap(), 8);
        assert!(parse_java_major("latest").is_err());
    }

    #[test]
    fn image_tag_swap() {
        assert_eq!(
            image_for_java("itzg/minecraft-server:latest", 17),
            "itzg/minecraft-server:java17"
        );
        assert_eq!(
            image_for_java("registry.local:5000/itzg/minecraft-server", 21),
            "registry.local:5000/itzg/minecraft-server:java21"
        );
        assert_eq!(image_for_java("ghcr.io/acme/terraria:1.4", 21), "ghcr.io/acme/terraria:1.4");
    }

    #[test]
    fn env_overrides_win_and_aliases_are_set() {
        let meta = ServerMetadata {
            server_type: Some("fabric".into()),
            version: Some("1.20.4".into()),
            loader_version: Some("0.15.7".into()),
            java_version: Some("21".into()),
            env_overrides: BTreeMap::from([("MAX_MEMORY".to_string(), "6G".to_string())]),
            ..Default::default()
        };
        let quota = ResourceQuota {
            min_ram_mb: 1024,
            max_ram_mb: 4096,
        };
        let env = provisioning_env(GameKind::Minecraft, &meta, quota, Some(25570));
        assert_eq!(env.get("TYPE").map(String::as_str), Some("FABRIC"));
        assert_eq!(env.get("FABRIC_LOADER_VERSION").map(String::as_str), Some("0.15.7"));
        assert_eq!(env.get("JAVA_VERSION_OVERRIDE").map(String::as_str), Some("true"));
        assert_eq!(env.get("MAX_MEMORY").map(String::as_str), Some("6G"));
        assert_eq!(env.get("INIT_MEMORY").map(String::as_str), Some("1024M"));
        assert_eq!(env.get("SERVER_PORT").map(String::as_str), Some("25570"));
    }

    #[test]
    fn stop_commands_per_game() {
        assert_eq!(GameKind::parse("Terraria").graceful_stop_command(), "exit");
        assert_eq!(GameKind::parse("dst").graceful_stop_command(), "c_shutdown(true)");
        assert_eq!(GameKind::parse("whatever"), GameKind::Generic);
        assert_eq!(
            is_save_line(GameKind::Minecraft, "[Server] Saved the game"),
            Some("saved the game")
        );
    }
}
