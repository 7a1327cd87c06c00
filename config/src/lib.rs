//! Loading session configuration from `~/.tether/config.toml`.
//!
//! ```toml
//! [servers.genjilsp]
//! name = "Genji"
//! crash_budget = 5
//! launch = { kind = "module", module = "${GENJI_HOME}/server.js" }
//! document_selector = [{ scheme = "file", language = "sql" }]
//! watch_patterns = ["**/*.sql"]
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tether_lsp::{LaunchDescriptor, SessionConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("no server named '{0}' in configuration")]
    UnknownServer(String),
    #[error("no servers configured")]
    NoServers,
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::UnknownServer(_) | ConfigError::NoServers => None,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    /// Sessions keyed by client id.
    #[serde(default)]
    servers: BTreeMap<String, SessionConfig>,
}

impl TetherConfig {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        Self::parse(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    /// Parse TOML text. Table keys become session ids and `${VAR}`
    /// references in launch settings are expanded.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        for (id, server) in &mut config.servers {
            if server.id.is_empty() {
                server.id.clone_from(id);
            }
            expand_launch(&mut server.launch);
            if let Some(root) = &server.root {
                server.root = Some(PathBuf::from(expand_env_vars(&root.to_string_lossy())));
            }
        }
        Ok(config)
    }

    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
    }

    #[must_use]
    pub fn servers(&self) -> &BTreeMap<String, SessionConfig> {
        &self.servers
    }

    /// The named server, or the first one when no name is given.
    pub fn server(&self, id: Option<&str>) -> Result<&SessionConfig, ConfigError> {
        match id {
            Some(id) => self
                .servers
                .get(id)
                .ok_or_else(|| ConfigError::UnknownServer(id.to_string())),
            None => self.servers.values().next().ok_or(ConfigError::NoServers),
        }
    }
}

fn expand_launch(launch: &mut LaunchDescriptor) {
    match launch {
        LaunchDescriptor::Executable { command, args } => {
            *command = expand_env_vars(command);
            expand_all(args);
        }
        LaunchDescriptor::Module {
            module,
            runtime,
            args,
            ..
        } => {
            *module = PathBuf::from(expand_env_vars(&module.to_string_lossy()));
            *runtime = expand_env_vars(runtime);
            expand_all(args);
        }
    }
}

fn expand_all(values: &mut [String]) {
    for value in values {
        *value = expand_env_vars(value);
    }
}

/// Replace `${VAR}` with the variable's value. Unset variables expand to
/// nothing; an unclosed `${` is kept as written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
