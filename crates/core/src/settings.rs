//! Worker settings
//!
//! Process-wide settings for the worker: server bind knobs consumed by the
//! bootstrap layer, the platform → docker image map, the in-container user,
//! and plugin data storage. Settings are loaded from a TOML file and threaded
//! through builder constructors as a value; there is no ambient global state.

use crate::errors::{ConfigError, DockerError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_container_user() -> String {
    "navvy".to_string()
}

fn default_plugins_data_dir() -> PathBuf {
    PathBuf::from("..")
}

/// Worker settings, typically loaded from `navvy.toml`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    /// Server bind address (consumed by the bootstrap layer)
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Server bind port (consumed by the bootstrap layer)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether the server should terminate TLS
    #[serde(default)]
    pub use_ssl: bool,

    /// TLS certificate path; required when `use_ssl` is set
    #[serde(default)]
    pub certfile: Option<PathBuf>,

    /// TLS key path; required when `use_ssl` is set
    #[serde(default)]
    pub keyfile: Option<PathBuf>,

    /// Map of platform tag → docker image for container builds
    #[serde(default)]
    pub docker_images: HashMap<String, String>,

    /// Non-root user inside build container images (home `/home/<user>`)
    #[serde(default = "default_container_user")]
    pub container_user: String,

    /// Root directory for plugin persistent data
    #[serde(default = "default_plugins_data_dir")]
    pub plugins_data_dir: PathBuf,

    /// Byte threshold above which buffered step output is flushed to the
    /// manager. Zero flushes after every line.
    #[serde(default)]
    pub output_buffer_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            use_ssl: false,
            certfile: None,
            keyfile: None,
            docker_images: HashMap::new(),
            container_user: default_container_user(),
            plugins_data_dir: default_plugins_data_dir(),
            output_buffer_len: 0,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());

        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { source })?;
        let settings: Settings = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.use_ssl && (self.certfile.is_none() || self.keyfile.is_none()) {
            return Err(ConfigError::Validation {
                message: "use_ssl requires both certfile and keyfile".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Resolve the docker image for a platform tag
    pub fn image_for(&self, platform: &str) -> Result<&str> {
        self.docker_images
            .get(platform)
            .map(String::as_str)
            .ok_or_else(|| {
                DockerError::MissingImage {
                    platform: platform.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.addr, "0.0.0.0");
        assert_eq!(settings.port, 7777);
        assert!(!settings.use_ssl);
        assert_eq!(settings.container_user, "navvy");
        assert_eq!(settings.output_buffer_len, 0);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
addr = "127.0.0.1"
port = 9999
container_user = "builder"
plugins_data_dir = "/var/lib/navvy/plugins"
output_buffer_len = 4096

[docker_images]
linux-generic = "navvy/linux:latest"
docker = "navvy/dind:latest"
"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.addr, "127.0.0.1");
        assert_eq!(settings.port, 9999);
        assert_eq!(settings.container_user, "builder");
        assert_eq!(settings.output_buffer_len, 4096);
        assert_eq!(settings.image_for("docker").unwrap(), "navvy/dind:latest");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load(Path::new("/no/such/navvy.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_ssl_requires_cert_and_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "use_ssl = true\n").unwrap();
        let err = Settings::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("certfile"));
    }

    #[test]
    fn test_image_for_unknown_platform() {
        let settings = Settings::default();
        let err = settings.image_for("some-plat").unwrap_err();
        assert!(err
            .to_string()
            .contains("No docker image configured for platform 'some-plat'"));
    }
}
