use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static INSTALLED_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("IMU_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging from `IMU_LOG`/`RUST_LOG` (default `info`).
pub fn init_logging() -> LevelFilter {
    init_logging_with(None)
}

/// Initialize stderr logging, preferring an explicit level over the
/// environment. Only the first call installs a logger; later calls return
/// the level already in effect.
pub fn init_logging_with(level: Option<&str>) -> LevelFilter {
    *INSTALLED_LEVEL.get_or_init(|| {
        let explicit = parse_level(level);
        let level = explicit.unwrap_or_else(env_level);
        let env = Env::default().default_filter_or(level_to_str(level));
        let mut builder = env_logger::Builder::from_env(env);
        if let Some(explicit) = explicit {
            builder.filter_level(explicit);
        }
        let installed = builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if installed.is_err() {
            // Another logger (e.g. a test harness) got there first.
            log::set_max_level(level);
        }
        level
    })
}
