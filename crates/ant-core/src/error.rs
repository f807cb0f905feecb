use std::fmt::Display;

/// ANT channel event and response codes, as carried in the `msg_code` field of
/// a channel event message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventCode(pub u8);

impl EventCode {
    pub const RESPONSE_NO_ERROR: Self = Self(0x00);
    pub const EVENT_RX_SEARCH_TIMEOUT: Self = Self(0x01);
    pub const EVENT_RX_FAIL: Self = Self(0x02);
    pub const EVENT_TX: Self = Self(0x03);
    pub const EVENT_TRANSFER_RX_FAILED: Self = Self(0x04);
    pub const EVENT_TRANSFER_TX_COMPLETED: Self = Self(0x05);
    pub const EVENT_TRANSFER_TX_FAILED: Self = Self(0x06);
    pub const EVENT_CHANNEL_CLOSED: Self = Self(0x07);
    pub const EVENT_RX_FAIL_GO_TO_SEARCH: Self = Self(0x08);
    pub const EVENT_CHANNEL_COLLISION: Self = Self(0x09);
    pub const EVENT_TRANSFER_TX_START: Self = Self(0x0A);
    pub const CHANNEL_IN_WRONG_STATE: Self = Self(0x15);
    pub const CHANNEL_NOT_OPENED: Self = Self(0x16);
    pub const CHANNEL_ID_NOT_SET: Self = Self(0x18);
    pub const CLOSE_ALL_CHANNELS: Self = Self(0x19);
    pub const TRANSFER_IN_PROGRESS: Self = Self(0x1F);
    pub const TRANSFER_SEQUENCE_NUMBER_ERROR: Self = Self(0x20);
    pub const TRANSFER_IN_ERROR: Self = Self(0x21);
    pub const MESSAGE_SIZE_EXCEEDS_LIMIT: Self = Self(0x27);
    pub const INVALID_MESSAGE: Self = Self(0x28);
    pub const INVALID_NETWORK_NUMBER: Self = Self(0x29);
    pub const INVALID_PARAMETER_PROVIDED: Self = Self(0x33);
    pub const EVENT_SERIAL_QUE_OVERFLOW: Self = Self(0x34);
    pub const EVENT_QUE_OVERFLOW: Self = Self(0x35);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::RESPONSE_NO_ERROR => "RESPONSE_NO_ERROR",
            Self::EVENT_RX_SEARCH_TIMEOUT => "EVENT_RX_SEARCH_TIMEOUT",
            Self::EVENT_RX_FAIL => "EVENT_RX_FAIL",
            Self::EVENT_TX => "EVENT_TX",
            Self::EVENT_TRANSFER_RX_FAILED => "EVENT_TRANSFER_RX_FAILED",
            Self::EVENT_TRANSFER_TX_COMPLETED => "EVENT_TRANSFER_TX_COMPLETED",
            Self::EVENT_TRANSFER_TX_FAILED => "EVENT_TRANSFER_TX_FAILED",
            Self::EVENT_CHANNEL_CLOSED => "EVENT_CHANNEL_CLOSED",
            Self::EVENT_RX_FAIL_GO_TO_SEARCH => "EVENT_RX_FAIL_GO_TO_SEARCH",
            Self::EVENT_CHANNEL_COLLISION => "EVENT_CHANNEL_COLLISION",
            Self::EVENT_TRANSFER_TX_START => "EVENT_TRANSFER_TX_START",
            Self::CHANNEL_IN_WRONG_STATE => "CHANNEL_IN_WRONG_STATE",
            Self::CHANNEL_NOT_OPENED => "CHANNEL_NOT_OPENED",
            Self::CHANNEL_ID_NOT_SET => "CHANNEL_ID_NOT_SET",
            Self::CLOSE_ALL_CHANNELS => "CLOSE_ALL_CHANNELS",
            Self::TRANSFER_IN_PROGRESS => "TRANSFER_IN_PROGRESS",
            Self::TRANSFER_SEQUENCE_NUMBER_ERROR => "TRANSFER_SEQUENCE_NUMBER_ERROR",
            Self::TRANSFER_IN_ERROR => "TRANSFER_IN_ERROR",
            Self::MESSAGE_SIZE_EXCEEDS_LIMIT => "MESSAGE_SIZE_EXCEEDS_LIMIT",
            Self::INVALID_MESSAGE => "INVALID_MESSAGE",
            Self::INVALID_NETWORK_NUMBER => "INVALID_NETWORK_NUMBER",
            Self::INVALID_PARAMETER_PROVIDED => "INVALID_PARAMETER_PROVIDED",
            Self::EVENT_SERIAL_QUE_OVERFLOW => "EVENT_SERIAL_QUE_OVERFLOW",
            Self::EVENT_QUE_OVERFLOW => "EVENT_QUE_OVERFLOW",
            _ => return None,
        })
    }
}

impl Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "UNKNOWN({:#04x})", self.0),
        }
    }
}

/// Errors surfaced by the session engine to calling code.
///
/// `Timeout` is kept distinct from device-reported failures: a timed out
/// acknowledged write may still have been applied by the peer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AntError {
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("transmit failed, peer did not acknowledge")]
    TxFailure,
    #[error("channel closed")]
    ChannelClosed,
    #[error("device reported {code} in response to message {msg_id:#04x}")]
    Device { msg_id: u8, code: EventCode },
    #[error("another command is already outstanding")]
    CommandOutstanding,
    #[error("session closed")]
    SessionClosed,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected reply to message {msg_id:#04x}")]
    UnexpectedReply { msg_id: u8 },
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

impl AntError {
    /// Classifies a non-success code carried in a channel response or event.
    #[must_use]
    pub fn from_code(msg_id: u8, code: EventCode) -> Self {
        match code {
            EventCode::EVENT_TRANSFER_TX_FAILED => Self::TxFailure,
            EventCode::EVENT_CHANNEL_CLOSED => Self::ChannelClosed,
            code => Self::Device { msg_id, code },
        }
    }
}
