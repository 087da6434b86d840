use clap::Parser;
use std::net::SocketAddr;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "crierd")]
#[command(about = "crier notice relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "CRIERD_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "CRIERD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// SQLite database path for the whitelist and event history
    /// (`:memory:` for an ephemeral store).
    #[arg(long, default_value = "crier.db", env = "CRIERD_STORE")]
    pub store: String,
    /// Admin command password. Omitting it disables the password check.
    #[arg(long, env = "CRIERD_ADMIN_SECRET")]
    pub admin_secret: Option<String>,
    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info", env = "CRIERD_LOG")]
    pub log_level: String,
    /// Seed a default admin whitelist entry on startup.
    #[arg(long, env = "CRIERD_SEED")]
    pub seed: bool,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "CRIERD_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "CRIERD_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum concurrently authenticated sessions per username.
    #[arg(long, default_value = "5", env = "CRIERD_MAX_USER_CONNS")]
    pub max_user_conns: usize,
    /// Frames admitted per connection within one rate window.
    #[arg(long, default_value = "100", env = "CRIERD_RATE_CAPACITY")]
    pub rate_capacity: u32,
    /// Sliding rate window length in seconds.
    #[arg(long, default_value = "60", env = "CRIERD_RATE_WINDOW")]
    pub rate_window: u64,
    /// Seconds an unauthenticated connection may stay open.
    #[arg(long, default_value = "30", env = "CRIERD_AUTH_TIMEOUT")]
    pub auth_timeout: u64,
    /// Interval between liveness pings in seconds.
    #[arg(long, default_value = "15", env = "CRIERD_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: u64,
    /// Maximum accepted text frame size in bytes.
    #[arg(long, default_value = "100000", env = "CRIERD_MAX_FRAME")]
    pub max_frame: usize,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// SQLite database path.
    pub store: String,
    /// Admin command password, when the check is enabled.
    pub admin_secret: Option<String>,
    /// Log filter when RUST_LOG is unset.
    pub log_level: String,
    /// Seed a default admin whitelist entry on startup.
    pub seed: bool,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum concurrently authenticated sessions per username.
    pub max_user_conns: usize,
    /// Frames admitted per connection within one rate window.
    pub rate_capacity: u32,
    /// Sliding rate window length in seconds.
    pub rate_window: u64,
    /// Seconds an unauthenticated connection may stay open.
    pub auth_timeout: u64,
    /// Interval between liveness pings in seconds.
    pub heartbeat_interval: u64,
    /// Maximum accepted text frame size in bytes.
    pub max_frame: usize,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.max_user_conns == 0 {
            return Err("max_user_conns must be greater than 0".to_string());
        }
        if self.max_user_conns > 100 {
            return Err("max_user_conns exceeds reasonable limit (100)".to_string());
        }

        if self.rate_capacity == 0 {
            return Err("rate_capacity must be greater than 0".to_string());
        }
        if self.rate_capacity > 1_000_000 {
            return Err("rate_capacity exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.rate_window == 0 {
            return Err("rate_window must be greater than 0".to_string());
        }
        if self.rate_window > 3600 {
            return Err("rate_window exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.auth_timeout == 0 {
            return Err("auth_timeout must be greater than 0".to_string());
        }
        if self.auth_timeout > 300 {
            return Err("auth_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.heartbeat_interval == 0 {
            return Err("heartbeat_interval must be greater than 0".to_string());
        }
        if self.heartbeat_interval > 3600 {
            return Err("heartbeat_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.max_frame == 0 {
            return Err("max_frame must be greater than 0".to_string());
        }
        if self.max_frame > crier_common::protocol::MAX_FRAME_BYTES {
            return Err(format!(
                "max_frame exceeds maximum allowed ({} bytes)",
                crier_common::protocol::MAX_FRAME_BYTES
            ));
        }

        if self.store.is_empty() {
            return Err("store path must not be empty".to_string());
        }

        if let Some(secret) = &self.admin_secret {
            if secret.is_empty() {
                return Err("admin_secret must not be empty when set".to_string());
            }
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            store: args.store,
            admin_secret: args.admin_secret,
            log_level: args.log_level,
            seed: args.seed,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_user_conns: args.max_user_conns,
            rate_capacity: args.rate_capacity,
            rate_window: args.rate_window,
            auth_timeout: args.auth_timeout,
            heartbeat_interval: args.heartbeat_interval,
            max_frame: args.max_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:8080".parse().unwrap(),
            metrics_addr: "127.0.0.1:9090".parse().unwrap(),
            store: ":memory:".to_string(),
            admin_secret: None,
            log_level: "info".to_string(),
            seed: false,
            max_conns: 1000,
            max_conns_ip: 10,
            max_user_conns: 5,
            rate_capacity: 100,
            rate_window: 60,
            auth_timeout: 30,
            heartbeat_interval: 15,
            max_frame: 100_000,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn max_conns_zero() {
        let mut c = valid_config();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_too_large() {
        let mut c = valid_config();
        c.max_conns = 1_000_001;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_ip_zero() {
        let mut c = valid_config();
        c.max_conns_ip = 0;
        assert!(c.validate().unwrap_err().contains("max_conns_ip"));
    }

    #[test]
    fn max_conns_ip_exceeds_max_conns() {
        let mut c = valid_config();
        c.max_conns_ip = c.max_conns + 1;
        assert!(c.validate().unwrap_err().contains("max_conns_ip"));
    }

    #[test]
    fn max_user_conns_bounds() {
        let mut c = valid_config();
        c.max_user_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_user_conns"));
        c.max_user_conns = 101;
        assert!(c.validate().unwrap_err().contains("max_user_conns"));
    }

    #[test]
    fn rate_capacity_bounds() {
        let mut c = valid_config();
        c.rate_capacity = 0;
        assert!(c.validate().unwrap_err().contains("rate_capacity"));
        c.rate_capacity = 1_000_001;
        assert!(c.validate().unwrap_err().contains("rate_capacity"));
    }

    #[test]
    fn rate_window_bounds() {
        let mut c = valid_config();
        c.rate_window = 0;
        assert!(c.validate().unwrap_err().contains("rate_window"));
        c.rate_window = 3601;
        assert!(c.validate().unwrap_err().contains("rate_window"));
    }

    #[test]
    fn auth_timeout_bounds() {
        let mut c = valid_config();
        c.auth_timeout = 0;
        assert!(c.validate().unwrap_err().contains("auth_timeout"));
        c.auth_timeout = 301;
        assert!(c.validate().unwrap_err().contains("auth_timeout"));
    }

    #[test]
    fn heartbeat_interval_bounds() {
        let mut c = valid_config();
        c.heartbeat_interval = 0;
        assert!(c.validate().unwrap_err().contains("heartbeat_interval"));
        c.heartbeat_interval = 3601;
        assert!(c.validate().unwrap_err().contains("heartbeat_interval"));
    }

    #[test]
    fn max_frame_bounds() {
        let mut c = valid_config();
        c.max_frame = 0;
        assert!(c.validate().unwrap_err().contains("max_frame"));
        c.max_frame = 100_001;
        assert!(c.validate().unwrap_err().contains("max_frame"));
    }

    #[test]
    fn empty_store_path_rejected() {
        let mut c = valid_config();
        c.store = String::new();
        assert!(c.validate().unwrap_err().contains("store"));
    }

    #[test]
    fn empty_admin_secret_rejected() {
        let mut c = valid_config();
        c.admin_secret = Some(String::new());
        assert!(c.validate().unwrap_err().contains("admin_secret"));
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = 1;
        c.max_conns_ip = 1;
        c.max_user_conns = 1;
        c.rate_capacity = 1;
        c.rate_window = 1;
        c.auth_timeout = 1;
        c.heartbeat_interval = 1;
        c.max_frame = 1;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn upper_boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = 1_000_000;
        c.max_conns_ip = 1_000_000;
        c.max_user_conns = 100;
        c.rate_capacity = 1_000_000;
        c.rate_window = 3600;
        c.auth_timeout = 300;
        c.heartbeat_interval = 3600;
        c.max_frame = 100_000;
        assert!(c.validate().is_ok());
    }
}
