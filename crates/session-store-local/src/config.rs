use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use session_store_core::HandlerConfig;

/// Configuration for the session-store-local command.
#[derive(Parser, Debug, Clone)]
#[command(name = "session-store-local")]
#[command(about = "Read, write and expire sessions in a shared local session store")]
pub struct Config {
    /// Base directory for records and lock files
    #[arg(long, env = "SESSION_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Identity of this node in a replicated setup (skews gc on nodes 2-9)
    #[arg(long, default_value = "1", env = "SESSION_NODE_ID")]
    pub node_id: i64,

    /// Seconds to wait for a session lock
    #[arg(long, default_value = "5", env = "SESSION_LOCK_TIMEOUT")]
    pub lock_timeout: u64,

    /// Seconds before an unchanged session gets its timestamp refreshed (0 = always)
    #[arg(long, default_value = "300", env = "SESSION_UNCHANGED_UPDATE_DELAY")]
    pub unchanged_update_delay: u64,

    /// Extra field stored with every content write, as key=value (repeatable).
    /// Values that parse as JSON are stored as JSON, anything else as a string.
    #[arg(long = "additional-data", value_parser = parse_key_value)]
    pub additional_data: Vec<(String, String)>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a session's payload to stdout
    Read { session_id: String },

    /// Store a payload for a session (from the argument, or stdin when omitted)
    Write {
        session_id: String,
        payload: Option<String>,
    },

    /// Delete a session
    Destroy { session_id: String },

    /// Expire sessions older than the given lifetime
    Gc {
        /// Maximum session lifetime in seconds
        #[arg(long, default_value = "1440")]
        max_lifetime: u64,
    },
}

impl Command {
    /// The session this command runs a cycle for, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Command::Read { session_id }
            | Command::Write { session_id, .. }
            | Command::Destroy { session_id } => Some(session_id),
            Command::Gc { .. } => None,
        }
    }
}

impl Config {
    /// Get the effective storage directory.
    pub fn effective_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("session-store")
        })
    }

    /// Build the handler configuration from the command-line options.
    pub fn handler_config(&self) -> HandlerConfig {
        let mut config = HandlerConfig::new()
            .with_lock_timeout(Duration::from_secs(self.lock_timeout))
            .with_unchanged_update_delay(Duration::from_secs(self.unchanged_update_delay));

        for (key, raw) in &self.additional_data {
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
            config = config.with_additional_data(key.clone(), value);
        }
        config
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}
