//! Layered configuration.
//!
//! Values are merged, later layers winning:
//! 1. built-in defaults,
//! 2. a config file (`--config <path>`, otherwise `srcwatch/config.toml` in
//!    the platform config directory if it exists),
//! 3. `SRCWATCH_`-prefixed environment variables, with `__` separating
//!    sections: `SRCWATCH_WATCH__DEBOUNCE_MS=250`.
//!
//! The file format follows the extension (`.yaml`/`.yml`, `.json`, anything
//! else is TOML).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SRCWATCH_";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hash: HashConfig,
    pub watch: WatchConfig,
    pub service: ServiceConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Read buffer size in bytes.
    pub chunk_size: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self { chunk_size: 64 * 1024 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Coalescing window in milliseconds; `0` delivers every notification.
    pub debounce_ms: u64,
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 100 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Largest number of bytes returned inline by an `open` request.
    pub open_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { open_limit: 1024 * 1024 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

impl Config {
    /// Load from every layer. `path` overrides the default file location and,
    /// unlike the default, must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path)?)
    }

    /// The merged providers, before extraction.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = merge_file(figment, path);
            },
            None => {
                if let Some(path) = Self::default_path() {
                    tracing::debug!(path = %path.display(), "Looking for config file");
                    figment = figment.merge(Toml::file(path));
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// `<platform config dir>/srcwatch/config.toml`, when a home directory
    /// can be determined.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "srcwatch").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if self.hash.chunk_size == 0 {
            exn::bail!(ErrorKind::Invalid { field: "hash.chunk_size", reason: "must be greater than zero" });
        }
        if self.service.open_limit == 0 {
            exn::bail!(ErrorKind::Invalid { field: "service.open_limit", reason: "must be greater than zero" });
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    fn load_in_jail(path: Option<&str>) -> figment::error::Result<Config> {
        Config::load(path.map(Path::new)).map_err(|err| {
            let kind: &ErrorKind = &err;
            figment::Error::from(kind.to_string())
        })
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_figment(Figment::from(Serialized::defaults(Config::default()))).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.hash.chunk_size, 65_536);
        assert_eq!(config.watch.debounce(), Duration::from_millis(100));
        assert_eq!(config.service.open_limit, 1_048_576);
        assert_eq!(config.log.filter, "info");
    }

    #[rstest]
    #[case("srcwatch.toml", "[watch]\ndebounce_ms = 25\n")]
    #[case("srcwatch.yaml", "watch:\n  debounce_ms: 25\n")]
    #[case("srcwatch.json", r#"{"watch": {"debounce_ms": 25}}"#)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        Jail::expect_with(|jail| {
            jail.create_file(name, contents)?;
            let config = load_in_jail(Some(name))?;
            assert_eq!(config.watch.debounce_ms, 25);
            assert_eq!(config.hash, HashConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[hash]\nchunk_size = 4096\n[log]\nfilter = \"debug\"\n")?;
            jail.set_env("SRCWATCH_HASH__CHUNK_SIZE", "8192");
            let config = load_in_jail(Some("config.toml"))?;
            assert_eq!(config.hash.chunk_size, 8192);
            assert_eq!(config.log.filter, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "")?;
            jail.set_env("SRCWATCH_HASH__CHUNK_SIZE", "0");
            let layers =
                Config::figment(Some(Path::new("config.toml"))).map_err(|e| figment::Error::from((*e).to_string()))?;
            let err = Config::from_figment(layers).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid { field: "hash.chunk_size", .. }));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_value() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[watch]\ndebounce_ms = \"soon\"\n")?;
            let layers =
                Config::figment(Some(Path::new("config.toml"))).map_err(|e| figment::Error::from((*e).to_string()))?;
            let err = Config::from_figment(layers).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }

    #[test]
    fn test_explicit_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = Config::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(missing) if *missing == path));
    }
}
