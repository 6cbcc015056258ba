use env_logger::Target;

/// Logs to stderr so that stdout only carries flows. `RUST_LOG` refines the
/// configured level.
pub fn init(level: &str) {
    let mut logger = env_logger::Builder::new();
    logger.format_timestamp_millis();
    logger.target(Target::Stderr);
    logger.parse_filters(level);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }

    logger.init();
}
