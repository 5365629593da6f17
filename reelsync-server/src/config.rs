//! CLI configuration for `reelsync-server`.
//!
//! Run mode:
//!   reelsync-server [--bind 0.0.0.0:8080] [--media /srv/film.mkv] [--config-check-secs 30]
//!
//! Scheduling parameters are not CLI flags.  They come from `REELSYNC_*`
//! environment variables so a bad value falls back to its default instead of
//! refusing to start.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "reelsync-server", about = "Synchronized playback media daemon")]
pub struct Config {
    // ---
    /// TCP address the HTTP interface listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// File to select at startup.  Without it nothing is served until an
    /// admin selects one through `POST /admin/select`.
    #[arg(long)]
    pub media: Option<PathBuf>,

    /// Seconds between re-reads of the `REELSYNC_*` environment.
    /// 0 turns the drift check off.
    #[arg(long, default_value = "30")]
    pub config_check_secs: u64,
}

// ---

impl Config {
    // ---
    pub fn config_check_interval(&self) -> Option<Duration> {
        (self.config_check_secs > 0).then(|| Duration::from_secs(self.config_check_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use clap::Parser;

    use super::Config;

    #[test]
    fn defaults() {
        // ---
        let config = Config::parse_from(["reelsync-server"]);
        assert_eq!(config.bind.port(), 8080);
        assert!(config.media.is_none());
        assert_eq!(config.config_check_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_disables_the_drift_check() {
        // ---
        let config = Config::parse_from(["reelsync-server", "--config-check-secs", "0", "--media", "/srv/a.mkv"]);
        assert_eq!(config.config_check_interval(), None);
        assert_eq!(config.media.as_deref(), Some(std::path::Path::new("/srv/a.mkv")));
    }
}
