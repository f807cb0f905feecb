use std::time::Duration;

/// Timing of the session engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for one attempt of a command.
    pub command_timeout: Duration,
    /// Extra attempts allowed by a command's retry policy.
    pub command_retries: usize,
    /// Transport read timeout of the reader thread; bounds how late an
    /// expired deadline is noticed.
    pub poll_interval: Duration,
    pub write_timeout: Duration,
    /// Time the device needs after a reset before it accepts commands.
    pub reset_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(1),
            command_retries: 3,
            poll_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(1),
            reset_delay: Duration::from_millis(500),
        }
    }
}

/// Parameters of an ANT-FS host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Sent to the device when pairing so the user can confirm it.
    pub host_name: String,
    pub host_id: u32,
    pub search_network_key: [u8; 8],
    pub search_rf_freq: u8,
    pub search_period: u16,
    pub search_waveform: u16,
    /// Channel search timeout, in 2.5 s units.
    pub search_timeout: u8,
    /// Candidate frequencies the device is asked to move to when linking.
    pub transport_rf_freqs: Vec<u8>,
    /// Beacon period code requested when linking.
    pub transport_period: u8,
    pub transport_search_timeout: u8,
    /// How long to wait for each expected beacon.
    pub beacon_timeout: Duration,
    pub direct_file_descriptor: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: "ant-session".to_owned(),
            host_id: 0x7E57_0001,
            search_network_key: [0xA8, 0xA4, 0x23, 0xB9, 0xF5, 0x5E, 0x63, 0xC1],
            search_rf_freq: 50,
            search_period: 4096,
            search_waveform: 0x0053,
            search_timeout: 0xFF,
            transport_rf_freqs: vec![3, 7, 15, 20, 25, 29, 34, 40, 45, 49, 54, 60, 65, 70, 75, 80],
            transport_period: 4,
            transport_search_timeout: 2,
            beacon_timeout: Duration::from_secs(2),
            direct_file_descriptor: 0xFFFF,
        }
    }
}
