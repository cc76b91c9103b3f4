//! Declarative session configuration
//!
//! Loads a line-oriented directive file from
//! `$XDG_CONFIG_HOME/corral/config`. Exactly one directive is recognized,
//! `multi-output <last|extend>`. Configuration is advisory: a missing,
//! unreadable or malformed file never aborts startup, it only produces a
//! log line and leaves the defaults in place.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::output::OutputPolicy;

/// Settings contributed by the config file. Every field is optional so
/// CLI flags and built-in defaults can layer on top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialConfig {
    /// Value of the `multi-output` directive, when present and valid.
    pub multi_output: Option<OutputPolicy>,
}

impl PartialConfig {
    /// Default config file location, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("corral").join("config"))
    }

    /// Load from the default location. Absence of a config directory or
    /// file yields the defaults.
    pub fn load_default() -> PartialConfig {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => PartialConfig::default(),
        }
    }

    pub fn load(path: &Path) -> PartialConfig {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config file at {}", path.display());
                PartialConfig::default()
            }
            Err(err) => {
                warn!("failed to read {}: {}", path.display(), err);
                PartialConfig::default()
            }
        }
    }

    /// Parse directive lines. Blank lines and `#` comments are skipped,
    /// unknown directives are ignored silently, and a recognized directive
    /// with a bad parameter is logged and dropped.
    fn parse(text: &str) -> PartialConfig {
        let mut config = PartialConfig::default();
        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let name = match words.next() {
                Some(name) => name,
                None => continue,
            };
            let params: Vec<&str> = words.collect();
            if name == "multi-output" {
                if params.len() != 1 {
                    warn!(
                        "directive 'multi-output' expects one parameter (line {})",
                        index + 1
                    );
                    continue;
                }
                match OutputPolicy::from_name(params[0]) {
                    Some(policy) => config.multi_output = Some(policy),
                    None => warn!(
                        "ignoring unknown multi-output mode '{}' (line {})",
                        params[0],
                        index + 1
                    ),
                }
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn recognizes_multi_output_last() {
        let config = PartialConfig::parse("multi-output last\n");
        assert_eq!(config.multi_output, Some(OutputPolicy::LastOnly));
    }

    #[test]
    fn recognizes_multi_output_extend() {
        let config = PartialConfig::parse("# kiosk config\n\nmulti-output extend\n");
        assert_eq!(config.multi_output, Some(OutputPolicy::Extend));
    }

    #[test]
    fn unknown_directives_are_ignored() {
        let config = PartialConfig::parse("cursor-theme Adwaita\nidle-timeout 300\n");
        assert_eq!(config, PartialConfig::default());
    }

    #[test]
    fn bad_parameter_count_keeps_default() {
        let config = PartialConfig::parse("multi-output\nmulti-output last extend\n");
        assert_eq!(config.multi_output, None);
    }

    #[test]
    fn unknown_mode_keeps_default() {
        let config = PartialConfig::parse("multi-output mirror\n");
        assert_eq!(config.multi_output, None);
    }

    #[test]
    fn later_directive_wins() {
        let config = PartialConfig::parse("multi-output extend\nmulti-output last\n");
        assert_eq!(config.multi_output, Some(OutputPolicy::LastOnly));
    }

    #[test]
    fn unreadable_file_yields_defaults() {
        let config = PartialConfig::load(Path::new("/nonexistent/corral/config"));
        assert_eq!(config, PartialConfig::default());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "multi-output last").unwrap();
        let config = PartialConfig::load(&path);
        assert_eq!(config.multi_output, Some(OutputPolicy::LastOnly));
    }
}
