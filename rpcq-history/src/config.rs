//! History table configuration.

use crate::error::HistoryError;
use crate::{DEFAULT_FRAME_CAPACITY, DEFAULT_HISTORY_DEPTH, MAX_HISTORY_DEPTH};
use rpcq_protocol::DEFAULT_MAX_CLIENTS;

/// Frame history table configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Configured history depth. The table keeps two more slots than this.
    pub depth: usize,
    /// Upper bound on targets per outbound item.
    pub max_clients: usize,
    /// Initial byte capacity of each frame buffer.
    pub frame_capacity: usize,
}

impl HistoryConfig {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    /// Checks the configuration before any frame is allocated.
    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.depth > MAX_HISTORY_DEPTH {
            return Err(HistoryError::InvalidDepth {
                depth: self.depth,
                max: MAX_HISTORY_DEPTH,
            });
        }
        if self.max_clients == 0 {
            return Err(HistoryError::InvalidMaxClients);
        }
        Ok(())
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_HISTORY_DEPTH,
            max_clients: DEFAULT_MAX_CLIENTS,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = HistoryConfig::new(4)
            .with_max_clients(16)
            .with_frame_capacity(64);
        assert_eq!(config.depth, 4);
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.frame_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(HistoryConfig::new(0).validate().is_ok());
        assert!(HistoryConfig::new(MAX_HISTORY_DEPTH).validate().is_ok());

        let err = HistoryConfig::new(MAX_HISTORY_DEPTH + 1)
            .validate()
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("257"));

        assert!(matches!(
            HistoryConfig::default().with_max_clients(0).validate(),
            Err(HistoryError::InvalidMaxClients)
        ));
    }
}
