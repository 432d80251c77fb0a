use log::LevelFilter;

/// Initialize env_logger for binaries and tests. Honors `RUST_LOG`;
/// defaults to warnings when it is unset. Safe to call more than once.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args())
    });

    let _ = builder.try_init();
}
