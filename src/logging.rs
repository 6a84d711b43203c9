use std::io::Write;

use chrono::Local;
use log::LevelFilter;

/// Installs env_logger. `RUST_LOG` overrides `default_level`.
/// Safe to call more than once; later calls are ignored.
pub fn init(default_level: LevelFilter) {
    let result = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() {
        log::info!("Logging initialized");
    }
}
