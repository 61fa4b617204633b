//! Queue configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::verbs::{ConnParams, QpInitAttr, QpType};
use crate::wire::HEADER_SIZE;

/// Tunables shared by every queue created from one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Receive buffers posted when a connection is set up.
    pub recv_buf_count: usize,
    /// Size of each receive buffer in bytes. Bounds the largest receivable message.
    pub recv_buf_size: usize,
    /// Maximum outstanding send work requests per queue pair.
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests per queue pair.
    pub max_recv_wr: u32,
    /// Maximum scatter-gather entries per work request.
    pub max_sge: u32,
    /// Maximum inline data per send, in bytes.
    pub max_inline_data: u32,
    /// Timeout handed to address and route resolution, in milliseconds.
    pub resolve_timeout_ms: u32,
    /// Initiator depth for the connect and accept handshakes.
    pub initiator_depth: u8,
    /// Responder resources for the connect and accept handshakes.
    pub responder_resources: u8,
    /// RNR retry count requested when connecting.
    pub connect_rnr_retry_count: u8,
    /// RNR retry count requested when accepting (7 = retry forever).
    pub accept_rnr_retry_count: u8,
    /// Completions drained from a completion queue per poll.
    pub completion_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            recv_buf_count: 1,
            recv_buf_size: 1024,
            max_send_wr: 20,
            max_recv_wr: 20,
            max_sge: 32,
            max_inline_data: 64,
            resolve_timeout_ms: 1,
            initiator_depth: 1,
            responder_resources: 1,
            connect_rnr_retry_count: 1,
            accept_rnr_retry_count: 7,
            completion_batch: 1,
        }
    }
}

impl QueueConfig {
    /// Loads a configuration from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: QueueConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.recv_buf_count == 0 {
            return Err(config_error("recv_buf_count must be at least 1"));
        }
        if self.recv_buf_size < HEADER_SIZE || self.recv_buf_size > u32::MAX as usize {
            return Err(config_error(format!(
                "recv_buf_size must be between {} and {} bytes",
                HEADER_SIZE,
                u32::MAX
            )));
        }
        if self.recv_buf_count > self.max_recv_wr as usize {
            return Err(config_error("recv_buf_count exceeds max_recv_wr"));
        }
        // header plus one (length, payload) pair
        if self.max_sge < 3 {
            return Err(config_error("max_sge must be at least 3"));
        }
        if self.max_send_wr == 0 {
            return Err(config_error("max_send_wr must be at least 1"));
        }
        if self.completion_batch == 0 {
            return Err(config_error("completion_batch must be at least 1"));
        }
        Ok(())
    }

    /// Largest number of segments a single push may carry.
    pub fn max_segments(&self) -> usize {
        (self.max_sge as usize - 1) / 2
    }

    /// Queue pair attributes derived from this configuration.
    pub fn qp_init_attr(&self) -> QpInitAttr {
        QpInitAttr {
            qp_type: QpType::ReliableConnected,
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            max_send_sge: self.max_sge,
            max_recv_sge: self.max_sge,
            max_inline_data: self.max_inline_data,
            sq_sig_all: true,
        }
    }

    /// Handshake parameters for the active side.
    pub fn connect_params(&self) -> ConnParams {
        ConnParams {
            initiator_depth: self.initiator_depth,
            responder_resources: self.responder_resources,
            rnr_retry_count: self.connect_rnr_retry_count,
        }
    }

    /// Handshake parameters for the passive side.
    pub fn accept_params(&self) -> ConnParams {
        ConnParams {
            initiator_depth: self.initiator_depth,
            responder_resources: self.responder_resources,
            rnr_retry_count: self.accept_rnr_retry_count,
        }
    }
}

fn config_error(reason: impl Into<String>) -> QueueError {
    QueueError::Config {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = QueueConfig::default();
        assert_eq!(config.recv_buf_count, 1);
        assert_eq!(config.recv_buf_size, 1024);
        assert_eq!(config.max_send_wr, 20);
        assert_eq!(config.max_recv_wr, 20);
        assert_eq!(config.max_inline_data, 64);
        assert_eq!(config.connect_rnr_retry_count, 1);
        assert_eq!(config.accept_rnr_retry_count, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_segments() {
        let config = QueueConfig {
            max_sge: 7,
            ..QueueConfig::default()
        };
        assert_eq!(config.max_segments(), 3);
        assert_eq!(QueueConfig::default().max_segments(), 15);
    }

    #[test]
    fn test_validate_rejects_tiny_recv_buffers() {
        let config = QueueConfig {
            recv_buf_size: HEADER_SIZE - 1,
            ..QueueConfig::default()
        };
        assert!(matches!(config.validate(), Err(QueueError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_small_sge_limit() {
        let config = QueueConfig {
            max_sge: 2,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = QueueConfig {
            completion_batch: 0,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_params_use_role_specific_retry() {
        let config = QueueConfig::default();
        assert_eq!(config.connect_params().rnr_retry_count, 1);
        assert_eq!(config.accept_params().rnr_retry_count, 7);
        let attr = config.qp_init_attr();
        assert_eq!(attr.qp_type, QpType::ReliableConnected);
        assert!(attr.sq_sig_all);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "recv_buf_count": 4,
                "recv_buf_size": 4096,
                "completion_batch": 8
            }}"#
        )
        .unwrap();

        let config = QueueConfig::from_file(file.path()).unwrap();
        assert_eq!(config.recv_buf_count, 4);
        assert_eq!(config.recv_buf_size, 4096);
        assert_eq!(config.completion_batch, 8);
        assert_eq!(config.max_send_wr, 20);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
recv_buf_size = 2048
max_sge = 9
resolve_timeout_ms = 500
            "#
        )
        .unwrap();

        let config = QueueConfig::from_file(file.path()).unwrap();
        assert_eq!(config.recv_buf_size, 2048);
        assert_eq!(config.max_segments(), 4);
        assert_eq!(config.resolve_timeout_ms, 500);
    }

    #[test]
    fn test_from_file_rejects_invalid_settings() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "recv_buf_count": 0 }}"#).unwrap();
        assert!(QueueConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(QueueConfig::from_file(file.path()).is_err());
    }
}
