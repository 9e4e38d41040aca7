use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};

use anyhow::Result;
use once_cell::sync::OnceCell;
use slog::*;

use rmqtt_impexp_conf::logging::{Level, Log, To};

pub use slog::Logger;

static LOGGER: OnceCell<Logger> = OnceCell::new();

/// Routes `log` records into an slog logger built from `cfg`. Only the first call installs
/// anything; later calls return the logger already in place.
pub fn init_logger(cfg: &Log) -> Result<Logger> {
    let logger = LOGGER.get_or_try_init(|| -> Result<Logger> {
        let logger = config_logger(cfg.filename(), cfg.to, cfg.level.clone());
        log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
            .map_err(|e| anyhow::Error::msg(format!("logger init error, {e}")))?;
        log::set_max_level(slog_log_to_level(cfg.level.inner()).to_level_filter());
        Ok(logger)
    })?;
    Ok(logger.clone())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(filename: String, to: To, level: Level) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    slog::Logger::root(drain, o!())
}

struct LevelFilter<D> {
    drain: D,
    level: Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level.inner()) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// Sends formatted output to the console, the log file, both or nowhere. The file is opened on
/// first use.
struct WriteFilter {
    filename: String,
    to: To,

    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.file()?.write(buf)?,
            To::Both => {
                let _ = self.console.write(buf)?;
                self.file()?.write(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush()?,
            To::File => self.file()?.flush()?,
            To::Both => {
                self.console.flush()?;
                self.file()?.flush()?;
            }
            To::Off => {}
        };
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {filename}, {e:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_write_filter_targets() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("impexp.log").to_string_lossy().into_owned();

        let mut off = WriteFilter::new(filename.clone(), To::Off);
        assert_eq!(off.write(b"dropped").unwrap(), 7);
        assert!(!dir.path().join("impexp.log").exists());

        let mut to_file = WriteFilter::new(filename.clone(), To::File);
        to_file.write_all(b"hello\n").unwrap();
        to_file.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&filename).unwrap(), "hello\n");

        let mut bad = WriteFilter::new(dir.path().to_string_lossy().into_owned(), To::File);
        assert!(bad.write(b"x").is_err());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
    }
}
