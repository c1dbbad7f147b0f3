//! Runtime settings read from the environment.

pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;
pub const DEFAULT_SLOW_COMMAND_MS: u64 = 100;
pub const DEFAULT_SERVER_NAME: &str = "graphd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bound of each graph's command queue. Senders wait when it is full.
    pub command_queue_capacity: usize,
    /// Bound of each actor mailbox. A full mailbox rejects the message.
    pub mailbox_capacity: usize,
    /// Bound of each client's channel-event mailbox.
    pub inbound_capacity: usize,
    pub slow_command_ms: u64,
    pub server_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            slow_command_ms: DEFAULT_SLOW_COMMAND_MS,
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source. Unparseable values fall back
    /// to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |name: &str, default: usize| {
            lookup(name)
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        Self {
            command_queue_capacity: number("GRAPHD_COMMAND_QUEUE_CAPACITY", DEFAULT_COMMAND_QUEUE_CAPACITY),
            mailbox_capacity: number("GRAPHD_MAILBOX_CAPACITY", DEFAULT_MAILBOX_CAPACITY),
            inbound_capacity: number("GRAPHD_INBOUND_CAPACITY", DEFAULT_INBOUND_CAPACITY),
            slow_command_ms: lookup("GRAPHD_SLOW_COMMAND_MS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_SLOW_COMMAND_MS),
            server_name: lookup("GRAPHD_SERVER_NAME")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(Config::from_lookup(|_| None), Config::default());
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let vars: HashMap<&str, &str> = [
            ("GRAPHD_MAILBOX_CAPACITY", "16"),
            ("GRAPHD_COMMAND_QUEUE_CAPACITY", "zero"),
            ("GRAPHD_INBOUND_CAPACITY", "0"),
            ("GRAPHD_SERVER_NAME", "atlas"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.mailbox_capacity, 16);
        assert_eq!(config.command_queue_capacity, DEFAULT_COMMAND_QUEUE_CAPACITY);
        assert_eq!(config.inbound_capacity, DEFAULT_INBOUND_CAPACITY);
        assert_eq!(config.server_name, "atlas");
    }
}
