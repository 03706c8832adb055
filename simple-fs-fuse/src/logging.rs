use log::{Level, LevelFilter, Log, Metadata, Record};

/// Writes every record to stderr as `[LEVEL target] message`, colored by
/// level. Records from simple-fs carry the module that raised them, e.g.
/// `simple_fs::chain`.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "\u{1b}[{}m[{:>5} {}] {}\u{1b}[0m",
            color_code(record.level()),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31,
        Level::Warn => 93,
        Level::Info => 34,
        Level::Debug => 32,
        Level::Trace => 90,
    }
}

/// Parse a `LOG` value, case-insensitively; unknown or missing means off
fn level_from(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(LevelFilter::Off)
}

/// Install the logger; the level comes from `LOG` (off when unset)
pub fn init() {
    static LOGGER: StderrLogger = StderrLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_from(std::env::var("LOG").ok().as_deref()));
    }
}
