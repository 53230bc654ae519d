//! Node configuration.

use crate::error::{NodeError, Result};
use shario_discovery::DiscoveryConfig;
use shario_transport::TransportConfig;
use std::path::PathBuf;

/// Node configuration
///
/// Everything has a sensible default; the CLI shell only overrides what the
/// user asked for.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the identity file; defaults to
    /// `<user config dir>/.shario`
    pub config_dir: Option<PathBuf>,
    /// Directory received files land in; defaults to
    /// `<user home>/Downloads/Shario`
    pub downloads_dir: Option<PathBuf>,
    /// Identity-file tag so co-resident instances never share an identity;
    /// defaults to the process id
    pub process_tag: Option<String>,
    /// Transport host settings
    pub transport: TransportConfig,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            config_dir: None,
            downloads_dir: None,
            process_tag: None,
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Resolve the config directory.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] when no user config directory exists
    /// and none was configured.
    pub fn resolve_config_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.config_dir {
            return Ok(dir.clone());
        }
        dirs::config_dir()
            .map(|dir| dir.join(".shario"))
            .ok_or(NodeError::config("no user config directory available"))
    }

    /// Resolve the downloads directory.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] when no home directory exists and no
    /// downloads directory was configured.
    pub fn resolve_downloads_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.downloads_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|dir| dir.join("Downloads").join("Shario"))
            .ok_or(NodeError::config("no home directory available"))
    }

    /// Resolve the identity-file tag.
    #[must_use]
    pub fn resolve_process_tag(&self) -> String {
        self.process_tag
            .clone()
            .unwrap_or_else(|| std::process::id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(config.config_dir.is_none());
        assert!(config.downloads_dir.is_none());
    }

    #[test]
    fn test_explicit_dirs_win() {
        let config = NodeConfig {
            config_dir: Some(PathBuf::from("/tmp/conf")),
            downloads_dir: Some(PathBuf::from("/tmp/dl")),
            ..NodeConfig::default()
        };

        assert_eq!(config.resolve_config_dir().unwrap(), PathBuf::from("/tmp/conf"));
        assert_eq!(config.resolve_downloads_dir().unwrap(), PathBuf::from("/tmp/dl"));
    }

    #[test]
    fn test_process_tag_defaults_to_pid() {
        let config = NodeConfig::default();
        assert_eq!(config.resolve_process_tag(), std::process::id().to_string());

        let tagged = NodeConfig {
            process_tag: Some("test-a".to_string()),
            ..NodeConfig::default()
        };
        assert_eq!(tagged.resolve_process_tag(), "test-a");
    }
}
