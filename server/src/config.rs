// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxmemoryPolicy {
    NoEviction,
    AllKeysRandom,
    AllKeysLru,
}

impl FromStr for MaxmemoryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "noeviction" => Ok(MaxmemoryPolicy::NoEviction),
            "allkeys-random" => Ok(MaxmemoryPolicy::AllKeysRandom),
            "allkeys-lru" => Ok(MaxmemoryPolicy::AllKeysLru),
            other => Err(ConfigError::Invalid(format!(
                "unknown maxmemory-policy: {other}"
            ))),
        }
    }
}

impl fmt::Display for MaxmemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MaxmemoryPolicy::NoEviction => "noeviction",
            MaxmemoryPolicy::AllKeysRandom => "allkeys-random",
            MaxmemoryPolicy::AllKeysLru => "allkeys-lru",
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// A structurally broken line: no '=' outside a section header, an
    /// unterminated section header, and so on.
    Parse { line: usize, reason: String },
    /// A value that parsed but is out of its allowed range.
    Invalid(String),
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse { line, reason } => {
                write!(f, "config parse error at line {line}: {reason}")
            }
            ConfigError::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Server configuration, read from an INI file with a `[server]` section for
/// the data plane and a `[runtime]` section for the ring workers. Unknown
/// keys are ignored; unparseable values fall back to their defaults with a
/// warning.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub hz: u32,
    pub maxclients: u32,
    pub maxmemory: u64,
    pub maxmemory_policy: MaxmemoryPolicy,
    pub maxmemory_samples: u32,
    pub active_expire_cycle_time_percent: u32,
    pub active_expire_acceptable_stale_percent: u32,
    pub active_expire_keys_per_loop: u32,

    pub client_executors: u32,
    pub sqpoll: bool,
    pub max_direct_fds_per_exr: u32,
    pub use_ring_buffer: bool,
    pub submit_batch_size: u32,
    pub wait_batch_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 6379,
            hz: 10,
            maxclients: 10000,
            maxmemory: 0,
            maxmemory_policy: MaxmemoryPolicy::NoEviction,
            maxmemory_samples: 5,
            active_expire_cycle_time_percent: 25,
            active_expire_acceptable_stale_percent: 10,
            active_expire_keys_per_loop: 20,
            client_executors: 2,
            sqpoll: false,
            max_direct_fds_per_exr: 4096,
            use_ring_buffer: true,
            submit_batch_size: 32,
            wait_batch_size: 1,
        }
    }
}

impl Config {
    pub fn read_from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Config::from_ini(&text)?;
        config.sanity_check()?;
        Ok(config)
    }

    pub fn from_ini(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        for (section, key, value) in parse_ini(text)? {
            match (section.as_str(), key.as_str()) {
                ("server", "port") => set(&mut config.port, &key, &value),
                ("server", "hz") => set(&mut config.hz, &key, &value),
                ("server", "maxclients") => {
                    set(&mut config.maxclients, &key, &value);
                    if config.maxclients == 0 {
                        config.maxclients = 10000;
                    }
                }
                ("server", "maxmemory") => set(&mut config.maxmemory, &key, &value),
                ("server", "maxmemory-policy") => {
                    config.maxmemory_policy = value.parse()?;
                }
                ("server", "maxmemory-samples") => {
                    set(&mut config.maxmemory_samples, &key, &value)
                }
                ("server", "active_expire_cycle_time_percent") => {
                    set(&mut config.active_expire_cycle_time_percent, &key, &value)
                }
                ("server", "active_expire_acceptable_stale_percent") => set(
                    &mut config.active_expire_acceptable_stale_percent,
                    &key,
                    &value,
                ),
                ("server", "active_expire_keys_per_loop") => {
                    set(&mut config.active_expire_keys_per_loop, &key, &value)
                }
                ("runtime", "client_executors") => {
                    set(&mut config.client_executors, &key, &value)
                }
                ("runtime", "sqpoll") => set(&mut config.sqpoll, &key, &value),
                ("runtime", "max_direct_fds_per_exr") => {
                    set(&mut config.max_direct_fds_per_exr, &key, &value)
                }
                ("runtime", "use_ring_buffer") => {
                    set(&mut config.use_ring_buffer, &key, &value)
                }
                ("runtime", "submit_batch_size") => {
                    set(&mut config.submit_batch_size, &key, &value)
                }
                ("runtime", "wait_batch_size") => {
                    set(&mut config.wait_batch_size, &key, &value)
                }
                _ => debug!("config: ignoring unknown key [{section}] {key}"),
            }
        }
        Ok(config)
    }

    pub fn sanity_check(&self) -> Result<(), ConfigError> {
        if self.hz == 0 || self.hz > 500 {
            return Err(ConfigError::Invalid(
                "hz is out of range, it should be in [1, 500]".into(),
            ));
        }
        if self.active_expire_cycle_time_percent == 0 || self.active_expire_cycle_time_percent > 40
        {
            return Err(ConfigError::Invalid(
                "active_expire_cycle_time_percent is out of range, it should be in [1, 40]".into(),
            ));
        }
        if self.active_expire_acceptable_stale_percent > 100 {
            return Err(ConfigError::Invalid(
                "active_expire_acceptable_stale_percent is out of range, it should be in [0, 100]"
                    .into(),
            ));
        }
        if self.client_executors == 0 {
            return Err(ConfigError::Invalid(
                "client_executors must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Configs: [port:{}, hz:{}, maxclients:{}, maxmemory:{}, maxmemory-policy:{}, \
             maxmemory-samples:{}, active_expire_cycle_time_percent:{}, \
             active_expire_acceptable_stale_percent:{}, active_expire_keys_per_loop:{}, \
             client_executors:{}, sqpoll:{}, max_direct_fds_per_exr:{}, use_ring_buffer:{}, \
             submit_batch_size:{}, wait_batch_size:{}].",
            self.port,
            self.hz,
            self.maxclients,
            self.maxmemory,
            self.maxmemory_policy,
            self.maxmemory_samples,
            self.active_expire_cycle_time_percent,
            self.active_expire_acceptable_stale_percent,
            self.active_expire_keys_per_loop,
            self.client_executors,
            self.sqpoll,
            self.max_direct_fds_per_exr,
            self.use_ring_buffer,
            self.submit_batch_size,
            self.wait_batch_size,
        )
    }
}

/// Assigns `value` parsed as `T`, keeping the previous value on a parse
/// failure. Option values are lenient; only structural problems and
/// out-of-range settings abort startup.
fn set<T: FromStr + fmt::Display>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("config: unparseable value for {key}: {value:?}, keeping {slot}"),
    }
}

/// A line-oriented INI scan: `[section]` headers, `key = value` pairs,
/// `;`/`#` comments. Section and key names are lowercased.
fn parse_ini(text: &str) -> Result<Vec<(String, String, String)>, ConfigError> {
    let mut entries = Vec::new();
    let mut section = String::new();
    for (index, raw) in text.lines().enumerate() {
        let line = match raw.find([';', '#']) {
            Some(pos) => raw[..pos].trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or(ConfigError::Parse {
                line: index + 1,
                reason: "unterminated section header".into(),
            })?;
            section = name.trim().to_lowercase();
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(ConfigError::Parse {
            line: index + 1,
            reason: "expected 'key = value'".into(),
        })?;
        entries.push((
            section.clone(),
            key.trim().to_lowercase(),
            value.trim().to_string(),
        ));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, 6379);
        assert_eq!(config.hz, 10);
        assert_eq!(config.maxmemory, 0);
        assert_eq!(config.maxmemory_policy, MaxmemoryPolicy::NoEviction);
        assert!(config.use_ring_buffer);
        config.sanity_check().unwrap();
    }

    #[test]
    fn full_file() {
        let config = Config::from_ini(
            "; ringkv config\n\
             [server]\n\
             port = 7000\n\
             hz = 20\n\
             maxclients = 0\n\
             maxmemory = 1048576\n\
             maxmemory-policy = allkeys-lru\n\
             maxmemory-samples = 7\n\
             active_expire_keys_per_loop = 40 # inline comment\n\
             \n\
             [runtime]\n\
             client_executors = 4\n\
             sqpoll = true\n\
             use_ring_buffer = false\n\
             wait_batch_size = 8\n",
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.hz, 20);
        assert_eq!(config.maxclients, 10000); // 0 falls back to the default
        assert_eq!(config.maxmemory, 1048576);
        assert_eq!(config.maxmemory_policy, MaxmemoryPolicy::AllKeysLru);
        assert_eq!(config.maxmemory_samples, 7);
        assert_eq!(config.active_expire_keys_per_loop, 40);
        assert_eq!(config.client_executors, 4);
        assert!(config.sqpoll);
        assert!(!config.use_ring_buffer);
        assert_eq!(config.wait_batch_size, 8);
    }

    #[test]
    fn unknown_keys_ignored_and_bad_values_keep_defaults() {
        let config = Config::from_ini(
            "[server]\nport = not-a-port\nfancy_feature = on\n[extras]\nx = 1\n",
        )
        .unwrap();
        assert_eq!(config.port, 6379);
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(
            Config::from_ini("[server\nport = 1\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            Config::from_ini("[server]\njust a line\n"),
            Err(ConfigError::Parse { line: 2, .. })
        ));
        assert!(Config::from_ini("[server]\nmaxmemory-policy = lfu\n").is_err());
    }

    #[test]
    fn range_checks() {
        let mut config = Config::default();
        config.hz = 501;
        assert!(config.sanity_check().is_err());

        let mut config = Config::default();
        config.active_expire_cycle_time_percent = 0;
        assert!(config.sanity_check().is_err());

        let mut config = Config::default();
        config.active_expire_acceptable_stale_percent = 101;
        assert!(config.sanity_check().is_err());
    }
}
