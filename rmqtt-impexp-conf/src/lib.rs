#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::{Config, File};
use serde::Deserialize;

use rmqtt_impexp_utils::deserialize_duration;

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    //Directory export files are written to.
    #[serde(default = "Inner::dir_default")]
    pub export_dir: String,
    //Directory import files are read from.
    #[serde(default = "Inner::dir_default")]
    pub import_dir: String,
    //Upper bound on concurrently active export and import requests.
    #[serde(default = "Inner::max_active_requests_default")]
    pub max_active_requests: usize,
    //Status file is rewritten every N records written by an export.
    #[serde(default = "Inner::status_frequency_default")]
    pub export_status_frequency: u64,
    //Status file is rewritten every N records read by an import.
    #[serde(default = "Inner::status_frequency_default")]
    pub import_status_frequency: u64,
    #[serde(default = "Inner::status_file_prefix_default")]
    pub status_file_prefix: String,
    #[serde(default = "Inner::server_name_default")]
    pub server_name: String,
    #[serde(default)]
    pub server_uid: String,
    #[serde(default)]
    pub kdf: Kdf,
    #[serde(default)]
    pub stop: Stop,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Inner {
    fn dir_default() -> String {
        "./export".into()
    }
    fn max_active_requests_default() -> usize {
        5
    }
    fn status_frequency_default() -> u64 {
        10_000
    }
    fn status_file_prefix_default() -> String {
        "impexp_".into()
    }
    fn server_name_default() -> String {
        "rmqtt".into()
    }
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rmqtt/rmqtt-impexp").required(false))
            .add_source(File::with_name("rmqtt-impexp").required(false))
            .add_source(config::Environment::with_prefix("rmqtt_impexp").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(name) = opts.server_name.as_ref() {
            inner.server_name.clone_from(name);
        }
        if let Some(uid) = opts.server_uid.as_ref() {
            inner.server_uid.clone_from(uid);
        }
        if let Some(dir) = opts.export_dir.as_ref() {
            inner.export_dir.clone_from(dir);
        }
        if let Some(dir) = opts.import_dir.as_ref() {
            inner.import_dir.clone_from(dir);
        }
        if let Some(max) = opts.max_active_requests {
            inner.max_active_requests = max;
        }
        if inner.server_uid.is_empty() {
            inner.server_uid = uuid::Uuid::new_v4().as_simple().to_string();
        }
        inner.kdf.check()?;

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("server_name is {}, server_uid is {}", self.server_name, self.server_uid);
        log::info!("export_dir is {}, import_dir is {}", self.export_dir, self.import_dir);
        log::info!("max_active_requests is {}", self.max_active_requests);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

/// Argon2id parameters used to derive the container key from the password.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Kdf {
    #[serde(default = "Kdf::memory_kib_default")]
    pub memory_kib: u32,
    #[serde(default = "Kdf::iterations_default")]
    pub iterations: u32,
}

impl Default for Kdf {
    #[inline]
    fn default() -> Self {
        Self { memory_kib: Self::memory_kib_default(), iterations: Self::iterations_default() }
    }
}

impl Kdf {
    pub const MIN_MEMORY_KIB: u32 = 8;
    pub const MAX_MEMORY_KIB: u32 = 1024 * 1024;
    pub const MAX_ITERATIONS: u32 = 64;

    fn memory_kib_default() -> u32 {
        19 * 1024
    }
    fn iterations_default() -> u32 {
        2
    }

    #[inline]
    pub fn in_bounds(memory_kib: u32, iterations: u32) -> bool {
        (Self::MIN_MEMORY_KIB..=Self::MAX_MEMORY_KIB).contains(&memory_kib)
            && (1..=Self::MAX_ITERATIONS).contains(&iterations)
    }

    fn check(&self) -> Result<()> {
        if !Self::in_bounds(self.memory_kib, self.iterations) {
            return Err(anyhow::anyhow!(
                "kdf parameters out of range, memory_kib: {}, iterations: {}",
                self.memory_kib,
                self.iterations
            ));
        }
        Ok(())
    }
}

/// Escalating pauses used while waiting for active requests to drain on stop.
#[derive(Debug, Clone, Deserialize)]
pub struct Stop {
    #[serde(default = "Stop::initial_pause_default", deserialize_with = "deserialize_duration")]
    pub initial_pause: Duration,
    #[serde(default = "Stop::medium_pause_default", deserialize_with = "deserialize_duration")]
    pub medium_pause: Duration,
    #[serde(default = "Stop::medium_after_default")]
    pub medium_after: u32,
    #[serde(default = "Stop::long_pause_default", deserialize_with = "deserialize_duration")]
    pub long_pause: Duration,
    #[serde(default = "Stop::long_after_default")]
    pub long_after: u32,
}

impl Default for Stop {
    #[inline]
    fn default() -> Self {
        Self {
            initial_pause: Self::initial_pause_default(),
            medium_pause: Self::medium_pause_default(),
            medium_after: Self::medium_after_default(),
            long_pause: Self::long_pause_default(),
            long_after: Self::long_after_default(),
        }
    }
}

impl Stop {
    fn initial_pause_default() -> Duration {
        Duration::from_millis(20)
    }
    fn medium_pause_default() -> Duration {
        Duration::from_millis(500)
    }
    fn medium_after_default() -> u32 {
        50
    }
    fn long_pause_default() -> Duration {
        Duration::from_secs(5)
    }
    fn long_after_default() -> u32 {
        290
    }

    /// Pause before the `loops`-th poll of the active request count.
    #[inline]
    pub fn pause(&self, loops: u32) -> Duration {
        if loops >= self.long_after {
            self.long_pause
        } else if loops >= self.medium_after {
            self.medium_pause
        } else {
            self.initial_pause
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::new(Options::default()).expect("Settings creation failed");
        assert_eq!(settings.max_active_requests, 5);
        assert_eq!(settings.status_file_prefix, "impexp_");
        assert_eq!(settings.kdf.iterations, 2);
        assert!(!settings.server_uid.is_empty());
        assert_eq!(settings.stop.pause(0), Duration::from_millis(20));
        assert_eq!(settings.stop.pause(50), Duration::from_millis(500));
        assert_eq!(settings.stop.pause(300), Duration::from_secs(5));
    }

    #[test]
    fn test_options_override() {
        let opts = Options {
            server_name: Some("node-a".into()),
            server_uid: Some("uid-a".into()),
            max_active_requests: Some(1),
            ..Default::default()
        };
        let settings = Settings::new(opts).expect("Settings creation failed");
        assert_eq!(settings.server_name, "node-a");
        assert_eq!(settings.server_uid, "uid-a");
        assert_eq!(settings.max_active_requests, 1);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impexp.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
export_dir = "/tmp/rmqtt-export"
import_status_frequency = 25

[kdf]
memory_kib = 64
iterations = 1

[stop]
initial_pause = "5ms"

[log]
to = "off"
level = "debug"
"#
        )
        .unwrap();
        let opts = Options { cfg_name: Some(path.to_string_lossy().to_string()), ..Default::default() };
        let settings = Settings::new(opts).expect("Settings creation failed");
        assert_eq!(settings.export_dir, "/tmp/rmqtt-export");
        assert_eq!(settings.import_status_frequency, 25);
        assert_eq!(settings.kdf.memory_kib, 64);
        assert_eq!(settings.stop.initial_pause, Duration::from_millis(5));
        assert!(settings.log.to.off());
        assert_eq!(settings.log.level.inner(), slog::Level::Debug);
    }

    #[test]
    fn test_kdf_bounds() {
        assert!(Kdf::in_bounds(64, 1));
        assert!(!Kdf::in_bounds(4, 1));
        assert!(!Kdf::in_bounds(64, 0));
        assert!(!Kdf::in_bounds(64, 1000));
    }
}
