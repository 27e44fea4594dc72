//! Tracing setup shared by the rftp binaries

/// Initialize the tracing subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `verbosity` picks the level for this
/// crate: 0 = info, 1 = debug, 2+ = trace.
///
/// ```bash
/// RUST_LOG=rftp::server=debug rftpd --root /srv/ftp
/// ```
pub fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("rftp={0},rftpd={0}", default_level)));
    // A second init (tests, embedding) is not an error worth failing over
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
