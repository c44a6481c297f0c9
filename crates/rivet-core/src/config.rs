//! Process-level configuration.
//!
//! Read once at startup from environment variables. The key names match the
//! wire-compatible peer implementations, so a deployment can carry one set
//! of settings across languages.

use std::time::Duration;

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| v.parse::<bool>().ok())
}

/// Runtime configuration shared by client and server facades.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client-side idle interval between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat misses before the connection is closed.
    pub heartbeat_max_miss: u32,
    /// Server-side read-idle limit before the connection is closed.
    pub server_idle: Duration,
    /// Writer buffer low watermark in bytes.
    pub low_watermark: usize,
    /// Writer buffer high watermark in bytes. A full writer queue refuses
    /// new sends.
    pub high_watermark: usize,
    /// Use a larger reusable read buffer per connection.
    pub pooled_buffers: bool,
    /// Enable the v2 protocol CRC32 trailer on outbound frames.
    pub crc_enabled: bool,
    /// Default TCP connect timeout; URLs can override per address.
    pub connect_timeout: Duration,
    /// Period of the background pool/invoke scanner.
    pub scan_interval: Duration,
}

impl Config {
    pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
    pub const DEFAULT_HEARTBEAT_MAX_MISS: u32 = 3;
    pub const DEFAULT_SERVER_IDLE_MS: u64 = 90_000;
    pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;
    pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
    pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 10_000;

    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let low = env_u64("bolt.netty.buffer.low_watermark")
            .map(|v| v as usize)
            .unwrap_or(Self::DEFAULT_LOW_WATERMARK);
        let high = env_u64("bolt.netty.buffer.high_watermark")
            .map(|v| v as usize)
            .unwrap_or(Self::DEFAULT_HIGH_WATERMARK)
            .max(low);
        Self {
            heartbeat_interval: Duration::from_millis(
                env_u64("bolt.tcp.heartbeat.interval")
                    .unwrap_or(Self::DEFAULT_HEARTBEAT_INTERVAL_MS),
            ),
            heartbeat_max_miss: env_u64("bolt.tcp.heartbeat.max_miss")
                .map(|v| v as u32)
                .unwrap_or(Self::DEFAULT_HEARTBEAT_MAX_MISS),
            server_idle: Duration::from_millis(Self::DEFAULT_SERVER_IDLE_MS),
            low_watermark: low,
            high_watermark: high,
            pooled_buffers: env_bool("bolt.netty.buffer.pooled").unwrap_or(true),
            crc_enabled: env_bool("bolt.crc.check").unwrap_or(false),
            connect_timeout: Duration::from_millis(Self::DEFAULT_CONNECT_TIMEOUT_MS),
            scan_interval: Duration::from_millis(Self::DEFAULT_SCAN_INTERVAL_MS),
        }
    }

    /// Writer queue capacity in frames, derived from the byte watermark.
    ///
    /// The writer is a bounded queue of encoded frames rather than a byte
    /// buffer, so the high watermark translates into a frame budget at a
    /// small-frame estimate of 64 bytes each.
    pub(crate) fn writer_queue_len(&self) -> usize {
        (self.high_watermark / 64).max(256)
    }

    /// Initial capacity of the per-connection read buffer.
    pub(crate) fn read_buffer_capacity(&self) -> usize {
        if self.pooled_buffers {
            64 * 1024
        } else {
            4 * 1024
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = Config::from_env();
        assert_eq!(cfg.heartbeat_max_miss, 3);
        assert_eq!(cfg.high_watermark, 64 * 1024);
        assert!(!cfg.crc_enabled);
        assert!(cfg.writer_queue_len() >= 256);
    }

    #[test]
    fn high_watermark_never_below_low() {
        let cfg = Config {
            low_watermark: 128 * 1024,
            high_watermark: 64 * 1024,
            ..Config::from_env()
        };
        // from_env clamps; hand-built configs are the caller's business,
        // but the queue derivation still yields a sane floor.
        assert!(cfg.writer_queue_len() >= 256);
    }
}
