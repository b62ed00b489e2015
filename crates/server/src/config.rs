//! Server configuration.
//!
//! Everything tunable at runtime lives here, parsed from flags with
//! env fallbacks. The one-shot command list is deliberately
//! configuration rather than code: the set is not assumed exhaustive.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "relayd",
    about = "AgentRelay: streaming relay for AI command-execution sessions"
)]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, env = "RELAY_BIND", default_value = "127.0.0.1:4400")]
    pub bind: String,

    /// Data directory (db, logs, uploads)
    #[arg(long, env = "RELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Agent backend binary; also resolvable via PATH
    #[arg(long, env = "RELAY_AGENT_BIN", default_value = "agent")]
    pub agent_bin: String,

    /// Optional bearer token required on every endpoint except /health
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Seconds a persistent subprocess may sit idle before eviction
    #[arg(long, env = "RELAY_SESSION_TIMEOUT_SECS", default_value_t = 300)]
    pub session_timeout_secs: u64,

    /// Interval between idle-eviction sweeps
    #[arg(long, env = "RELAY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Hard cap on concurrently live backend subprocesses
    #[arg(long, env = "RELAY_MAX_PROCESSES", default_value_t = 16)]
    pub max_processes: usize,

    /// Hard maximum for a single request, seconds
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Seconds between coordinator heartbeats to subscribers
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value_t = 15)]
    pub heartbeat_secs: u64,

    /// Comma-separated command names that always run one-shot.
    /// Prefix wildcards are supported ("/debug*").
    #[arg(
        long,
        env = "RELAY_ONE_SHOT_COMMANDS",
        default_value = "/help,/status,/clear,/compact",
        value_delimiter = ','
    )]
    pub one_shot_commands: Vec<String>,

    /// Role-lookup cache TTL, seconds. Zero disables the cache.
    #[arg(long, env = "RELAY_ROLE_CACHE_TTL_SECS", default_value_t = 60)]
    pub role_cache_ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cfg = ServerConfig::parse_from(["relayd"]);
        assert_eq!(cfg.session_timeout_secs, 300);
        assert_eq!(cfg.sweep_interval_secs, 60);
        assert!(cfg.one_shot_commands.contains(&"/help".to_string()));
    }

    #[test]
    fn one_shot_commands_split_on_commas() {
        let cfg = ServerConfig::parse_from(["relayd", "--one-shot-commands", "/a,/b*"]);
        assert_eq!(cfg.one_shot_commands, vec!["/a", "/b*"]);
    }
}
