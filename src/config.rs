//! Process-wide configuration, loaded once at startup.
//!
//! All the timing constants the spec pins down (rate-limit spacing,
//! assignment TTL, sweep intervals, dedup windows) live here rather
//! than scattered through the components, so a deployment can tune them
//! without touching component code.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the FreePBX host this process drives. Required.
    pub freepbx_ip: String,
    /// Base URL this process advertises to the PBX for action-script
    /// callbacks, e.g. `http://localhost:3000`.
    pub action_base_url: String,
    /// HTTP port this process listens on.
    pub port: u16,

    pub pbx_rest_timeout: Duration,
    pub trunk_fetch_timeout: Duration,
    pub catalog_fetch_timeout: Duration,

    pub catalog_refresh_interval: Duration,
    pub trunk_refresh_interval: Duration,

    pub origination_spacing: Duration,
    pub origination_queue_limit: usize,

    pub assignment_ttl: Duration,

    pub call_sweep_interval: Duration,
    pub call_ttl: Duration,

    pub push_terminal_close_delay: Duration,

    pub demux_reconnect_attempts: u32,
    pub demux_reconnect_backoff: Duration,

    pub dedup_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            freepbx_ip: String::new(),
            action_base_url: "http://localhost:3000".to_string(),
            port: 3000,
            pbx_rest_timeout: Duration::from_secs(5),
            trunk_fetch_timeout: Duration::from_secs(10),
            catalog_fetch_timeout: Duration::from_secs(10),
            catalog_refresh_interval: Duration::from_secs(5 * 60),
            trunk_refresh_interval: Duration::from_secs(30),
            origination_spacing: Duration::from_millis(1100),
            origination_queue_limit: 50,
            assignment_ttl: Duration::from_secs(120),
            call_sweep_interval: Duration::from_secs(60),
            call_ttl: Duration::from_secs(15 * 60),
            push_terminal_close_delay: Duration::from_secs(5),
            demux_reconnect_attempts: 5,
            demux_reconnect_backoff: Duration::from_secs(5),
            dedup_window: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Build configuration from the environment, falling back to the
    /// first CLI argument for `FREEPBX_IP` as the source does. Exits
    /// the process with status 1 if no PBX host can be found -- there
    /// is nothing useful this process can do without one.
    pub fn from_env(mut args: impl Iterator<Item = String>) -> Self {
        let mut cfg = Self::default();

        cfg.freepbx_ip = std::env::var("FREEPBX_IP")
            .ok()
            .or_else(|| args.nth(1))
            .unwrap_or_default();

        if cfg.freepbx_ip.is_empty() {
            tracing::error!("FREEPBX_IP is required (env var or first argument)");
            std::process::exit(1);
        }

        if let Ok(base) = std::env::var("ACTION_BASE_URL") {
            cfg.action_base_url = base;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                cfg.port = port;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.origination_spacing, Duration::from_millis(1100));
        assert_eq!(cfg.assignment_ttl, Duration::from_secs(120));
        assert_eq!(cfg.origination_queue_limit, 50);
        assert_eq!(cfg.call_ttl, Duration::from_secs(900));
    }
}
