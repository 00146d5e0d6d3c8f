//! lodestone.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub macros: MacroSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    pub name: String,
    /// Directory holding one subdirectory per instance.
    pub instances_dir: PathBuf,
    /// Broadcast channel capacity and buffered event log length.
    pub event_buffer: usize,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            name: "lodestone".to_string(),
            instances_dir: PathBuf::from("instances"),
            event_buffer: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Timeout for getters, setters, and console commands (e.g. "30s").
    pub call_timeout: String,
    /// Timeout for start, stop, and restart (e.g. "5m").
    pub lifecycle_timeout: String,
    /// Timeout for a kill before the instance is declared errored.
    pub kill_timeout: String,
    /// Pending state-mutating calls allowed per instance.
    pub queue_depth: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            call_timeout: "30s".to_string(),
            lifecycle_timeout: "5m".to_string(),
            kill_timeout: "10s".to_string(),
            queue_depth: 32,
        }
    }
}

impl DispatchSection {
    pub fn call_timeout(&self) -> Duration {
        parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn lifecycle_timeout(&self) -> Duration {
        parse_duration(&self.lifecycle_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn kill_timeout(&self) -> Duration {
        parse_duration(&self.kill_timeout).unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroSection {
    /// Finished macro runs kept per instance.
    pub history_limit: usize,
}

impl Default for MacroSection {
    fn default() -> Self {
        Self { history_limit: 100 }
    }
}

impl HostConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a lodestone.toml rooted at `instances_dir`.
    pub fn scaffold(name: &str, instances_dir: &Path) -> Self {
        HostConfig {
            host: HostSection {
                name: name.to_string(),
                instances_dir: instances_dir.to_path_buf(),
                ..HostSection::default()
            },
            dispatch: DispatchSection::default(),
            macros: MacroSection::default(),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("dispatch.call_timeout", &self.dispatch.call_timeout),
            ("dispatch.lifecycle_timeout", &self.dispatch.lifecycle_timeout),
            ("dispatch.kill_timeout", &self.dispatch.kill_timeout),
        ] {
            if parse_duration(value).is_none() {
                anyhow::bail!("{field}: cannot parse duration {value:?}");
            }
        }
        if self.host.event_buffer == 0 {
            anyhow::bail!("host.event_buffer must be at least 1");
        }
        if self.dispatch.queue_depth == 0 {
            anyhow::bail!("dispatch.queue_depth must be at least 1");
        }
        Ok(())
    }
}

/// Parse "500ms", "30s", "5m", "1h", or a plain number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let m = mins.trim().parse::<u64>().ok()?;
        m.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let h = hours.trim().parse::<u64>().ok()?;
        h.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_round_trips_through_toml() {
        let config = HostConfig::scaffold("home-lab", Path::new("/srv/lodestone"));
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("home-lab"));
        let parsed = HostConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.host.instances_dir, PathBuf::from("/srv/lodestone"));
    }

    #[test]
    fn test_parse_minimal() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config.host.name, "lodestone");
        assert_eq!(config.dispatch.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.dispatch.lifecycle_timeout(), Duration::from_secs(300));
        assert_eq!(config.macros.history_limit, 100);
    }

    #[test]
    fn test_parse_dispatch_overrides() {
        let toml_str = r#"
[dispatch]
call_timeout = "500ms"
lifecycle_timeout = "2m"
kill_timeout = "3s"
queue_depth = 4
"#;
        let config = HostConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.dispatch.call_timeout(), Duration::from_millis(500));
        assert_eq!(config.dispatch.lifecycle_timeout(), Duration::from_secs(120));
        assert_eq!(config.dispatch.kill_timeout(), Duration::from_secs(3));
        assert_eq!(config.dispatch.queue_depth, 4);
    }

    #[test]
    fn test_rejects_bad_duration() {
        let toml_str = r#"
[dispatch]
call_timeout = "soon"
lifecycle_timeout = "5m"
kill_timeout = "10s"
queue_depth = 32
"#;
        assert!(HostConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("x"), None);
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        assert_eq!(parse_duration("307445734561825861m"), None);
        assert_eq!(parse_duration("5124095576030432h"), None);
        assert_eq!(
            parse_duration("307445734561825860m"),
            Some(Duration::from_secs(307445734561825860 * 60))
        );
    }
}
