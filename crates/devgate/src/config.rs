//! Gateway configuration file and command-line overrides.
//!
//! The file is JSON; every key is optional and falls back to the library
//! defaults. Durations are strings such as `"180s"` or `"500ms"`.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use devgate_session::{GatewayConfig, RegistryConfig};
use serde::{Deserialize, Serialize};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, session_error, CliError, CliResult, DATA_INVALID, USAGE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub udp_addr: SocketAddr,
    pub tcp_addr: Option<SocketAddr>,
    pub recv_buffer_size: Option<usize>,
    pub min_datagram_len: usize,
    pub max_read_len: usize,
    pub unknown_sample_len: usize,
    pub workers: usize,
    pub inbound_queue_capacity: usize,
    pub send_queue_capacity: usize,
    pub tcp_max_frame_len: usize,
    #[serde(with = "duration_str")]
    pub channel_idle_timeout: Duration,
    #[serde(with = "duration_str")]
    pub expiry_window: Duration,
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
}

impl Default for FileConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        let registry = RegistryConfig::default();
        Self {
            udp_addr: gateway.udp_addr,
            tcp_addr: gateway.tcp_addr,
            recv_buffer_size: gateway.mux.socket.recv_buffer_size,
            min_datagram_len: gateway.mux.min_datagram_len,
            max_read_len: gateway.mux.max_read_len,
            unknown_sample_len: gateway.mux.unknown_sample_len,
            workers: gateway.mux.workers,
            inbound_queue_capacity: gateway.mux.inbound_queue_capacity,
            send_queue_capacity: gateway.mux.send.capacity,
            tcp_max_frame_len: gateway.tcp.max_frame_len,
            channel_idle_timeout: gateway.mux.idle_timeout,
            expiry_window: registry.expiry_window,
            sweep_interval: registry.sweep_interval,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        serde_json::from_str(&text).map_err(|err| {
            CliError::new(
                DATA_INVALID,
                format!("invalid config {}: {err}", path.display()),
            )
        })
    }

    /// Start from `--config` if given, then apply flag overrides.
    pub fn resolve(args: &ServeArgs) -> CliResult<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(addr) = args.udp {
            config.udp_addr = addr;
        }
        if let Some(addr) = args.tcp {
            config.tcp_addr = Some(addr);
        }
        if let Some(workers) = args.workers {
            config.workers = workers;
        }
        if let Some(expiry) = &args.expiry {
            config.expiry_window = parse_duration(expiry)?;
        }
        if let Some(interval) = &args.sweep_interval {
            config.sweep_interval = parse_duration(interval)?;
        }
        if let Some(idle) = &args.idle_timeout {
            config.channel_idle_timeout = parse_duration(idle)?;
        }
        Ok(config)
    }

    /// Split into library configs, validating both.
    pub fn into_parts(self) -> CliResult<(GatewayConfig, RegistryConfig)> {
        let mut gateway = GatewayConfig {
            udp_addr: self.udp_addr,
            tcp_addr: self.tcp_addr,
            ..GatewayConfig::default()
        };
        gateway.mux.socket.recv_buffer_size = self.recv_buffer_size;
        gateway.mux.min_datagram_len = self.min_datagram_len;
        gateway.mux.max_read_len = self.max_read_len;
        gateway.mux.unknown_sample_len = self.unknown_sample_len;
        gateway.mux.workers = self.workers;
        gateway.mux.inbound_queue_capacity = self.inbound_queue_capacity;
        gateway.mux.send.capacity = self.send_queue_capacity;
        gateway.mux.idle_timeout = self.channel_idle_timeout;
        gateway.tcp.socket.recv_buffer_size = self.recv_buffer_size;
        gateway.tcp.max_frame_len = self.tcp_max_frame_len;
        gateway.tcp.unknown_sample_len = self.unknown_sample_len;
        gateway.tcp.send.capacity = self.send_queue_capacity;

        let registry = RegistryConfig {
            expiry_window: self.expiry_window,
            sweep_interval: self.sweep_interval,
        };

        gateway
            .validate()
            .map_err(|err| session_error("invalid config", err))?;
        registry
            .validate()
            .map_err(|err| session_error("invalid config", err))?;
        Ok((gateway, registry))
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('m') {
        (num, "m")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).map_err(|err| serde::de::Error::custom(err.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn file_keys_override_defaults() {
        let config: FileConfig = serde_json::from_str(
            r#"{ "udp_addr": "127.0.0.1:9100", "workers": 8, "expiry_window": "90s" }"#,
        )
        .unwrap();
        assert_eq!(config.udp_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.workers, 8);
        assert_eq!(config.expiry_window, Duration::from_secs(90));
        assert_eq!(config.sweep_interval, FileConfig::default().sweep_interval);

        let (gateway, registry) = config.into_parts().unwrap();
        assert_eq!(gateway.mux.workers, 8);
        assert_eq!(registry.expiry_window, Duration::from_secs(90));
    }

    #[test]
    fn unknown_keys_and_bad_limits_are_rejected() {
        assert!(serde_json::from_str::<FileConfig>(r#"{ "wrokers": 2 }"#).is_err());

        let config = FileConfig {
            min_datagram_len: 4096,
            max_read_len: 1024,
            ..FileConfig::default()
        };
        assert_eq!(config.into_parts().unwrap_err().code, USAGE);
    }

    #[test]
    fn durations_round_trip_through_json() {
        let text = serde_json::to_string(&FileConfig::default()).unwrap();
        let back: FileConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, FileConfig::default());
    }
}
