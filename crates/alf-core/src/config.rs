use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of this process; replies to our work items are addressed here.
    pub host_id: String,

    // Maintenance loops
    pub heartbeat_interval: Duration,
    pub queue_poll_timeout: Duration,

    // Local runner
    pub tenants_file: PathBuf,
    pub dry_run: bool,

    // Slack
    pub slack_api_base: String,
    pub slack_http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: "localhost".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            queue_poll_timeout: Duration::from_millis(5000),
            tenants_file: PathBuf::from("tenants.json"),
            dry_run: false,
            slack_api_base: "https://slack.com/api".to_string(),
            slack_http_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        let defaults = Self::default();

        let cfg = Self {
            host_id: env_nonblank("ALF_HOST_ID")
                .or_else(|| env_nonblank("HOSTNAME"))
                .unwrap_or(defaults.host_id),
            heartbeat_interval: env_u64("ALF_HEARTBEAT_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            queue_poll_timeout: env_u64("ALF_QUEUE_POLL_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_poll_timeout),
            tenants_file: env_nonblank("ALF_TENANTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tenants_file),
            dry_run: env_bool("ALF_DRY_RUN").unwrap_or(defaults.dry_run),
            slack_api_base: env_nonblank("SLACK_API_BASE")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.slack_api_base),
            slack_http_timeout: env_u64("SLACK_HTTP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.slack_http_timeout),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Zero periods would make the maintenance loops spin.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("ALF_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("ALF_QUEUE_POLL_TIMEOUT_MS", self.queue_poll_timeout),
            ("SLACK_HTTP_TIMEOUT_SECS", self.slack_http_timeout),
        ];
        match periods.iter().find(|(_, d)| d.is_zero()) {
            Some((key, _)) => Err(Error::Config(format!("{key} must be greater than zero"))),
            None => Ok(()),
        }
    }
}

/// Unset and blank values are both `None`.
fn env_nonblank(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_none() {
            env::set_var(key, val);
        }
    }
}

/// `KEY=value` lines; `#` comments and an optional `export ` prefix are
/// accepted.
fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, val) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), unquote(val.trim()).to_string()))
        })
        .collect()
}

fn unquote(val: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| val.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(val)
}

/// Unrecognised values fall back to the default.
fn env_bool(key: &str) -> Option<bool> {
    env_nonblank(key).and_then(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Unset or blank is `None`; anything unparsable is a config error.
fn env_u64(key: &str) -> Result<Option<u64>> {
    let Some(raw) = env_nonblank(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_parsing_skips_comments_and_strips_quotes() {
        let parsed = parse_dotenv(
            "# comment\nALF_HOST_ID=\"bot-1\"\n\nBROKEN\n =x\nexport A='b c'\nB=\"x'\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("ALF_HOST_ID".to_string(), "bot-1".to_string()),
                ("A".to_string(), "b c".to_string()),
                ("B".to_string(), "\"x'".to_string()),
            ]
        );
    }

    #[test]
    fn bool_values() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool(" 1 "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn zero_periods_are_rejected() {
        assert!(Config::default().validate().is_ok());

        let cfg = Config {
            queue_poll_timeout: Duration::ZERO,
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("ALF_QUEUE_POLL_TIMEOUT_MS"), "{err}");

        let cfg = Config {
            heartbeat_interval: Duration::ZERO,
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("ALF_HEARTBEAT_INTERVAL_SECS"), "{err}");
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
        assert!(!cfg.queue_poll_timeout.is_zero());
        assert!(cfg.slack_api_base.starts_with("https://"));
    }
}
