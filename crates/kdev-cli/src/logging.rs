//! Subscriber bootstrap for `kdevctl`'s `main()`. Library crates only
//! ever `tracing::info!`/`warn!`/etc. — no crate below this one calls
//! `tracing_subscriber::fmt().init()` itself, so a single process can
//! host exactly one subscriber and this is it.

use tracing_subscriber::EnvFilter;

/// Human-readable for interactive use, JSON for anything piped or run
/// under a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// Install the global subscriber. Filter directive comes from
/// `KDEV_LOG` (e.g. `kdev_devicepool=debug,info`), defaulting to
/// `info` when unset or unparseable.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_env("KDEV_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = match format {
        LogFormat::Human => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("[kdev] logging already initialized: {e}");
    }
}
