use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::PorticoConfig};

/// File names probed during discovery, in priority order.
const CONFIG_FILENAMES: &[&str] = &["portico.toml", "portico.yaml", "portico.yml", "portico.json"];

/// When set (via [`set_config_dir`]), discovery is pinned to this single
/// directory so tests never pick up a developer's real config.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Pin config discovery to `path`. Replaces any previous override.
pub fn set_config_dir(path: PathBuf) {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.lock() {
        *guard = Some(path);
    }
}

/// Remove the discovery pin set by [`set_config_dir`].
pub fn clear_config_dir() {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.lock() {
        *guard = None;
    }
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.lock().ok().and_then(|g| g.clone())
}

/// On-disk serialization format, picked by file extension.
#[derive(Debug, Clone, Copy)]
enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") | None => Ok(Self::Toml),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            Some(other) => anyhow::bail!("unsupported config format: .{other}"),
        }
    }

    fn parse(self, raw: &str) -> anyhow::Result<PorticoConfig> {
        match self {
            Self::Toml => Ok(toml::from_str(raw)?),
            Self::Yaml => Ok(serde_yaml::from_str(raw)?),
            Self::Json => Ok(serde_json::from_str(raw)?),
        }
    }
}

/// Read, env-substitute, and parse one config file.
pub fn load_config(path: &Path) -> anyhow::Result<PorticoConfig> {
    let format = ConfigFormat::from_path(path)?;
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    format.parse(&substitute_env(&raw))
}

/// Locate and load the active config, falling back to defaults.
///
/// Probes `./portico.{toml,yaml,yml,json}` first, then the user-global
/// `~/.config/portico/` directory. A file that exists but fails to parse
/// is reported and skipped rather than aborting startup.
pub fn discover_and_load() -> PorticoConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return PorticoConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            PorticoConfig::default()
        },
    }
}

fn find_config_file() -> Option<PathBuf> {
    candidate_dirs()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// Directories probed for a config file, highest priority first. An
/// override pins the search to exactly one directory.
fn candidate_dirs() -> Vec<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return vec![dir];
    }
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(global) = user_config_dir() {
        dirs.push(global);
    }
    dirs
}

/// The directory `config get`/`config path` report: the override when
/// pinned, `~/.config/portico/` otherwise.
pub fn config_dir() -> Option<PathBuf> {
    config_dir_override().or_else(user_config_dir)
}

fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("portico"))
}

#[allow(clippy::unwrap_used, clippy::expect_used, unsafe_code)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_env_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.toml");
        unsafe { std::env::set_var("PORTICO_LOADER_TOKEN", "secret-from-env") };
        std::fs::write(
            &path,
            "[gateway.auth]\ntoken = \"${PORTICO_LOADER_TOKEN}\"\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.auth.token.as_deref(), Some("secret-from-env"));
        unsafe { std::env::remove_var("PORTICO_LOADER_TOKEN") };
    }

    #[test]
    fn loads_yaml_and_json_formats() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("portico.yaml");
        std::fs::write(&yaml, "gateway:\n  port: 4200\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().gateway.port, 4200);

        let json = dir.path().join("portico.json");
        std::fs::write(&json, r#"{"gateway": {"port": 4300}}"#).unwrap();
        assert_eq!(load_config(&json).unwrap().gateway.port, 4300);
    }

    #[test]
    fn rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.ini");
        std::fs::write(&path, "whatever").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn filename_priority_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("portico.toml"), "[gateway]\nport = 1\n").unwrap();
        std::fs::write(dir.path().join("portico.json"), r#"{"gateway":{"port":2}}"#).unwrap();

        set_config_dir(dir.path().to_path_buf());
        let cfg = discover_and_load();
        clear_config_dir();
        assert_eq!(cfg.gateway.port, 1);
    }
}
