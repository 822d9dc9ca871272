//! Runtime and scheduler configuration

use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Default stack size of stackful units (256 KiB)
pub const DEFAULT_THREAD_STACKSIZE: usize = 256 * 1024;

/// Default stack size of scheduler units (1 MiB)
pub const DEFAULT_SCHED_STACKSIZE: usize = 1024 * 1024;

/// Default number of scheduling iterations between event checks
pub const DEFAULT_SCHED_EVENT_FREQ: u32 = 50;

/// Default idle sleep of predefined schedulers
pub const DEFAULT_SCHED_SLEEP: Duration = Duration::from_micros(100);

/// Default maximum number of execution streams
pub const DEFAULT_MAX_NUM_XSTREAMS: usize = 1024;

/// Smallest accepted stack size
pub const MIN_STACKSIZE: usize = 16 * 1024;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Stack size of stackful units created without an explicit size
    pub thread_stacksize: usize,

    /// Stack size of units that run stacked schedulers
    pub sched_stacksize: usize,

    /// Scheduling iterations between event checks in predefined schedulers
    pub sched_event_freq: u32,

    /// How long a predefined scheduler sleeps after an idle event check
    pub sched_sleep: Duration,

    /// Maximum number of live execution streams (primary included)
    pub max_xstreams: usize,

    /// Number of default-sized stacks kept for reuse
    pub stack_cache: usize,

    /// Whether tool callbacks are delivered
    pub tool: bool,

    /// Pin each secondary stream to core `rank % num_cores` when it starts
    pub set_affinity: bool,

    /// Cores available to the process
    pub num_cores: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_stacksize: DEFAULT_THREAD_STACKSIZE,
            sched_stacksize: DEFAULT_SCHED_STACKSIZE,
            sched_event_freq: DEFAULT_SCHED_EVENT_FREQ,
            sched_sleep: DEFAULT_SCHED_SLEEP,
            max_xstreams: DEFAULT_MAX_NUM_XSTREAMS,
            stack_cache: 128,
            tool: true,
            set_affinity: false,
            num_cores: num_cpus::get(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `FIBRIL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values returned by `lookup`
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("FIBRIL_THREAD_STACKSIZE") {
            config.thread_stacksize = parse_env(&v, "FIBRIL_THREAD_STACKSIZE")?;
        }
        if let Some(v) = lookup("FIBRIL_SCHED_STACKSIZE") {
            config.sched_stacksize = parse_env(&v, "FIBRIL_SCHED_STACKSIZE")?;
        }
        if let Some(v) = lookup("FIBRIL_SCHED_EVENT_FREQ") {
            config.sched_event_freq = parse_env(&v, "FIBRIL_SCHED_EVENT_FREQ")?;
        }
        if let Some(v) = lookup("FIBRIL_SCHED_SLEEP_NSEC") {
            config.sched_sleep = Duration::from_nanos(parse_env(&v, "FIBRIL_SCHED_SLEEP_NSEC")?);
        }
        if let Some(v) = lookup("FIBRIL_MAX_NUM_XSTREAMS") {
            config.max_xstreams = parse_env(&v, "FIBRIL_MAX_NUM_XSTREAMS")?;
        }
        if let Some(v) = lookup("FIBRIL_SET_AFFINITY") {
            config.set_affinity = parse_env(&v, "FIBRIL_SET_AFFINITY")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.thread_stacksize < MIN_STACKSIZE {
            return Err(Error::InvalidArg("thread stack size below minimum"));
        }
        if self.sched_stacksize < MIN_STACKSIZE {
            return Err(Error::InvalidArg("scheduler stack size below minimum"));
        }
        if self.sched_event_freq == 0 {
            return Err(Error::InvalidArg("scheduler event frequency must be positive"));
        }
        if self.max_xstreams == 0 {
            return Err(Error::InvalidArg("at least one execution stream is required"));
        }
        if self.num_cores == 0 {
            return Err(Error::InvalidArg("at least one core is required"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(value: &str, _key: &'static str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArg("malformed FIBRIL_* environment value"))
}

/// A typed scheduler configuration value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigValue {
    /// Integer value
    Int(i64),
    /// Floating-point value
    Double(f64),
    /// Opaque pointer-sized value
    Ptr(usize),
}

/// Key into a [`SchedConfig`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey(pub u32);

/// Key/typed-value list consumed when a scheduler is created
#[derive(Debug, Clone, Default)]
pub struct SchedConfig {
    values: FxHashMap<ConfigKey, ConfigValue>,
}

impl SchedConfig {
    /// Event-check frequency of predefined schedulers (`Int`)
    pub const EVENT_FREQ: ConfigKey = ConfigKey(0);
    /// Whether the scheduler is freed with its owner (`Int`, non-zero = true)
    pub const AUTOMATIC: ConfigKey = ConfigKey(1);
    /// Idle sleep of predefined schedulers in nanoseconds (`Int`)
    pub const SLEEP_NSEC: ConfigKey = ConfigKey(2);

    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, builder style
    pub fn with(mut self, key: ConfigKey, value: ConfigValue) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value
    pub fn set(&mut self, key: ConfigKey, value: ConfigValue) {
        self.values.insert(key, value);
    }

    /// Raw value for `key`
    pub fn get(&self, key: ConfigKey) -> Option<ConfigValue> {
        self.values.get(&key).copied()
    }

    /// Integer value for `key`, `None` if absent
    pub fn get_int(&self, key: ConfigKey) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(v)) => Ok(Some(v)),
            Some(other) => Err(Error::InvalidSchedConfig(format!(
                "key {} holds {:?}, expected an integer",
                key.0, other
            ))),
        }
    }

    /// Floating-point value for `key`, `None` if absent
    pub fn get_double(&self, key: ConfigKey) -> Result<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Double(v)) => Ok(Some(v)),
            Some(other) => Err(Error::InvalidSchedConfig(format!(
                "key {} holds {:?}, expected a double",
                key.0, other
            ))),
        }
    }

    /// Pointer-sized value for `key`, `None` if absent
    pub fn get_ptr(&self, key: ConfigKey) -> Result<Option<usize>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Ptr(v)) => Ok(Some(v)),
            Some(other) => Err(Error::InvalidSchedConfig(format!(
                "key {} holds {:?}, expected a pointer",
                key.0, other
            ))),
        }
    }

    /// Event frequency, falling back to `default`
    pub(crate) fn event_freq(&self, default: u32) -> Result<u32> {
        match self.get_int(Self::EVENT_FREQ)? {
            Some(v) if v > 0 => Ok(v.min(u32::MAX as i64) as u32),
            Some(_) => Err(Error::InvalidSchedConfig(
                "event frequency must be positive".to_string(),
            )),
            None => Ok(default),
        }
    }

    /// Idle sleep, falling back to `default`
    pub(crate) fn sleep(&self, default: Duration) -> Result<Duration> {
        match self.get_int(Self::SLEEP_NSEC)? {
            Some(v) if v >= 0 => Ok(Duration::from_nanos(v as u64)),
            Some(_) => Err(Error::InvalidSchedConfig(
                "sleep time must not be negative".to_string(),
            )),
            None => Ok(default),
        }
    }

    /// Automatic flag, falling back to `default`
    pub(crate) fn automatic(&self, default: bool) -> Result<bool> {
        Ok(self.get_int(Self::AUTOMATIC)?.map(|v| v != 0).unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sched_event_freq, DEFAULT_SCHED_EVENT_FREQ);
    }

    #[test]
    fn test_config_env_overlay() {
        let config = Config::from_lookup(|key| match key {
            "FIBRIL_THREAD_STACKSIZE" => Some("65536".to_string()),
            "FIBRIL_SCHED_EVENT_FREQ" => Some(" 8 ".to_string()),
            "FIBRIL_SCHED_SLEEP_NSEC" => Some("2000".to_string()),
            "FIBRIL_SET_AFFINITY" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.thread_stacksize, 65536);
        assert_eq!(config.sched_event_freq, 8);
        assert_eq!(config.sched_sleep, Duration::from_nanos(2000));
        assert_eq!(config.max_xstreams, DEFAULT_MAX_NUM_XSTREAMS);
        assert!(config.set_affinity);
        assert!(config.num_cores >= 1);
    }

    #[test]
    fn test_config_env_rejects_garbage() {
        let result = Config::from_lookup(|key| {
            (key == "FIBRIL_MAX_NUM_XSTREAMS").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidArg(_))));

        let result = Config::from_lookup(|key| {
            (key == "FIBRIL_THREAD_STACKSIZE").then(|| "1024".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidArg(_))));
    }

    #[test]
    fn test_sched_config_typed_reads() {
        let config = SchedConfig::new()
            .with(SchedConfig::EVENT_FREQ, ConfigValue::Int(16))
            .with(ConfigKey(7), ConfigValue::Double(0.5));

        assert_eq!(config.get_int(SchedConfig::EVENT_FREQ).unwrap(), Some(16));
        assert_eq!(config.get_double(ConfigKey(7)).unwrap(), Some(0.5));
        assert_eq!(config.get_int(ConfigKey(9)).unwrap(), None);
        assert!(matches!(
            config.get_int(ConfigKey(7)),
            Err(Error::InvalidSchedConfig(_))
        ));
        assert_eq!(config.event_freq(50).unwrap(), 16);
        assert!(!config.automatic(false).unwrap());
    }

    #[test]
    fn test_sched_config_rejects_zero_freq() {
        let config = SchedConfig::new().with(SchedConfig::EVENT_FREQ, ConfigValue::Int(0));
        assert!(config.event_freq(50).is_err());
    }
}
