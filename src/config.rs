//! Runtime configuration.

/// Tunables for the manager and its streams.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BleConfig {
    /// Index of the Bluetooth adapter to use.
    pub adapter_index: usize,
    /// Buffer between the platform scan task and the scan consumer.
    pub scan_buffer: usize,
    /// Decoded values buffered per observed characteristic.
    pub notification_buffer: usize,
    /// Host events buffered per bridge stream.
    pub event_buffer: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_buffer: 64,
            notification_buffer: 32,
            event_buffer: 64,
        }
    }
}

impl BleConfig {
    /// Use the adapter at `index`.
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set the scan buffer size (minimum 1).
    pub fn with_scan_buffer(mut self, size: usize) -> Self {
        self.scan_buffer = size.max(1);
        self
    }

    /// Set the per-characteristic notification buffer size (minimum 1).
    pub fn with_notification_buffer(mut self, size: usize) -> Self {
        self.notification_buffer = size.max(1);
        self
    }

    /// Set the per-stream host event buffer size (minimum 1).
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}
