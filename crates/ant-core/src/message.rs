use std::fmt::Display;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U16, U32},
};

use crate::EventCode;

/// Numeric ANT message identifiers.
pub mod id {
    pub const CHANNEL_EVENT: u8 = 0x40;
    pub const UNASSIGN_CHANNEL: u8 = 0x41;
    pub const ASSIGN_CHANNEL: u8 = 0x42;
    pub const SET_CHANNEL_PERIOD: u8 = 0x43;
    pub const SET_CHANNEL_SEARCH_TIMEOUT: u8 = 0x44;
    pub const SET_CHANNEL_RF_FREQ: u8 = 0x45;
    pub const SET_NETWORK_KEY: u8 = 0x46;
    pub const SET_SEARCH_WAVEFORM: u8 = 0x49;
    pub const RESET_SYSTEM: u8 = 0x4A;
    pub const OPEN_CHANNEL: u8 = 0x4B;
    pub const CLOSE_CHANNEL: u8 = 0x4C;
    pub const REQUEST_MESSAGE: u8 = 0x4D;
    pub const BROADCAST_DATA: u8 = 0x4E;
    pub const ACKNOWLEDGED_DATA: u8 = 0x4F;
    pub const BURST_TRANSFER_DATA: u8 = 0x50;
    /// `SetChannelId` host to device, `ChannelId` device to host.
    pub const CHANNEL_ID: u8 = 0x51;
    pub const CHANNEL_STATUS: u8 = 0x52;
    pub const CAPABILITIES: u8 = 0x54;
    pub const ANT_VERSION: u8 = 0x3E;
    pub const SERIAL_NUMBER: u8 = 0x61;
    pub const STARTUP_MESSAGE: u8 = 0x6F;
    pub const SERIAL_ERROR: u8 = 0xAE;
}

/// `msg_id` used by channel events that are not a response to a command.
pub const EVENT_MSG_ID: u8 = 0x01;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ResetSystem {
    pub filler: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelNumber {
    pub channel_number: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AssignChannel {
    pub channel_number: u8,
    pub channel_type: u8,
    pub network_number: u8,
}

/// Layout shared by `SetChannelId` and the `ChannelId` reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelId {
    pub channel_number: u8,
    pub device_number: U16,
    pub device_type: u8,
    pub trans_type: u8,
}
impl ChannelId {
    #[must_use]
    pub fn new(channel_number: u8, device_number: u16, device_type: u8, trans_type: u8) -> Self {
        Self {
            channel_number,
            device_number: U16::new(device_number),
            device_type,
            trans_type,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelPeriod {
    pub channel_number: u8,
    pub period: U16,
}
impl ChannelPeriod {
    #[must_use]
    pub fn new(channel_number: u8, period: u16) -> Self {
        Self {
            channel_number,
            period: U16::new(period),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelSearchTimeout {
    pub channel_number: u8,
    pub timeout: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelRfFreq {
    pub channel_number: u8,
    pub rf_freq: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct NetworkKey {
    pub network_number: u8,
    pub key: [u8; 8],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SearchWaveform {
    pub channel_number: u8,
    pub waveform: U16,
}
impl SearchWaveform {
    #[must_use]
    pub fn new(channel_number: u8, waveform: u16) -> Self {
        Self {
            channel_number,
            waveform: U16::new(waveform),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RequestMessage {
    pub channel_number: u8,
    pub msg_id: u8,
}

/// Eight byte data payload used by broadcast, acknowledged and burst
/// messages.
///
/// For burst packets the upper three bits of `channel_number` carry the
/// sequence counter (bits 5-6) and the last packet flag (bit 7).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelData {
    pub channel_number: u8,
    pub data: [u8; 8],
}
impl ChannelData {
    const LAST_PACKET: u8 = 0x80;

    #[must_use]
    pub fn new(channel_number: u8, data: [u8; 8]) -> Self {
        Self {
            channel_number,
            data,
        }
    }

    /// Builds one burst packet with its sequence counter and last flag.
    #[must_use]
    pub fn burst_packet(channel_number: u8, sequence: u8, last: bool, data: [u8; 8]) -> Self {
        let mut number = (channel_number & 0x1F) | ((sequence & 0x03) << 5);
        if last {
            number |= Self::LAST_PACKET;
        }
        Self::new(number, data)
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        self.channel_number & 0x1F
    }

    #[must_use]
    pub fn sequence(&self) -> u8 {
        (self.channel_number >> 5) & 0x03
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.channel_number & Self::LAST_PACKET != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelEvent {
    pub channel_number: u8,
    /// Id of the message this responds to, or [`EVENT_MSG_ID`] for events.
    pub msg_id: u8,
    pub msg_code: u8,
}
impl ChannelEvent {
    #[must_use]
    pub fn code(&self) -> EventCode {
        EventCode(self.msg_code)
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        self.msg_id == EVENT_MSG_ID
    }
}

/// Channel state as reported in the low two bits of the status byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unassigned,
    Assigned,
    Searching,
    Tracking,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChannelStatus {
    pub channel_number: u8,
    pub status: u8,
}
impl ChannelStatus {
    #[must_use]
    pub fn state(&self) -> ChannelState {
        match self.status & 0x03 {
            0 => ChannelState::Unassigned,
            1 => ChannelState::Assigned,
            2 => ChannelState::Searching,
            _ => ChannelState::Tracking,
        }
    }
}

/// Version string, NUL padded. AP1 hardware sends 9 bytes, AP2 sends 11.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AntVersion {
    pub version: [u8; 11],
}
impl AntVersion {
    /// Copies a short or full length version payload, padding with NUL.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut version = [0; 11];
        let len = payload.len().min(version.len());
        version[..len].copy_from_slice(&payload[..len]);
        Self { version }
    }
}
impl Display for AntVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self
            .version
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.version.len());
        write!(f, "{}", String::from_utf8_lossy(&self.version[..end]))
    }
}

/// Only the first four bytes are interpreted; newer hardware appends more.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Capabilities {
    pub max_channels: u8,
    pub max_networks: u8,
    pub standard_options: u8,
    pub advanced_options: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SerialNumber {
    pub serial: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct StartupMessage {
    pub reason: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SerialError {
    pub code: u8,
}

/// A typed ANT message, in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ResetSystem(ResetSystem),
    AssignChannel(AssignChannel),
    UnassignChannel(ChannelNumber),
    SetChannelId(ChannelId),
    SetChannelPeriod(ChannelPeriod),
    SetChannelSearchTimeout(ChannelSearchTimeout),
    SetChannelRfFreq(ChannelRfFreq),
    SetNetworkKey(NetworkKey),
    SetSearchWaveform(SearchWaveform),
    OpenChannel(ChannelNumber),
    CloseChannel(ChannelNumber),
    RequestMessage(RequestMessage),
    BroadcastData(ChannelData),
    AcknowledgedData(ChannelData),
    BurstTransferData(ChannelData),
    StartupMessage(StartupMessage),
    SerialError(SerialError),
    ChannelEvent(ChannelEvent),
    ChannelStatus(ChannelStatus),
    ChannelId(ChannelId),
    AntVersion(AntVersion),
    Capabilities(Capabilities),
    SerialNumber(SerialNumber),
    /// A device message without a registry entry, kept as raw payload.
    Unimplemented { id: u8, data: Vec<u8> },
}

impl Message {
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Message::ResetSystem(_) => id::RESET_SYSTEM,
            Message::AssignChannel(_) => id::ASSIGN_CHANNEL,
            Message::UnassignChannel(_) => id::UNASSIGN_CHANNEL,
            Message::SetChannelId(_) | Message::ChannelId(_) => id::CHANNEL_ID,
            Message::SetChannelPeriod(_) => id::SET_CHANNEL_PERIOD,
            Message::SetChannelSearchTimeout(_) => id::SET_CHANNEL_SEARCH_TIMEOUT,
            Message::SetChannelRfFreq(_) => id::SET_CHANNEL_RF_FREQ,
            Message::SetNetworkKey(_) => id::SET_NETWORK_KEY,
            Message::SetSearchWaveform(_) => id::SET_SEARCH_WAVEFORM,
            Message::OpenChannel(_) => id::OPEN_CHANNEL,
            Message::CloseChannel(_) => id::CLOSE_CHANNEL,
            Message::RequestMessage(_) => id::REQUEST_MESSAGE,
            Message::BroadcastData(_) => id::BROADCAST_DATA,
            Message::AcknowledgedData(_) => id::ACKNOWLEDGED_DATA,
            Message::BurstTransferData(_) => id::BURST_TRANSFER_DATA,
            Message::StartupMessage(_) => id::STARTUP_MESSAGE,
            Message::SerialError(_) => id::SERIAL_ERROR,
            Message::ChannelEvent(_) => id::CHANNEL_EVENT,
            Message::ChannelStatus(_) => id::CHANNEL_STATUS,
            Message::AntVersion(_) => id::ANT_VERSION,
            Message::Capabilities(_) => id::CAPABILITIES,
            Message::SerialNumber(_) => id::SERIAL_NUMBER,
            Message::Unimplemented { id, .. } => *id,
        }
    }

    /// The packed payload, without sync, length, id or checksum.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Message::ResetSystem(m) => m.as_bytes().to_vec(),
            Message::AssignChannel(m) => m.as_bytes().to_vec(),
            Message::UnassignChannel(m) | Message::OpenChannel(m) | Message::CloseChannel(m) => {
                m.as_bytes().to_vec()
            }
            Message::SetChannelId(m) | Message::ChannelId(m) => m.as_bytes().to_vec(),
            Message::SetChannelPeriod(m) => m.as_bytes().to_vec(),
            Message::SetChannelSearchTimeout(m) => m.as_bytes().to_vec(),
            Message::SetChannelRfFreq(m) => m.as_bytes().to_vec(),
            Message::SetNetworkKey(m) => m.as_bytes().to_vec(),
            Message::SetSearchWaveform(m) => m.as_bytes().to_vec(),
            Message::RequestMessage(m) => m.as_bytes().to_vec(),
            Message::BroadcastData(m)
            | Message::AcknowledgedData(m)
            | Message::BurstTransferData(m) => m.as_bytes().to_vec(),
            Message::StartupMessage(m) => m.as_bytes().to_vec(),
            Message::SerialError(m) => m.as_bytes().to_vec(),
            Message::ChannelEvent(m) => m.as_bytes().to_vec(),
            Message::ChannelStatus(m) => m.as_bytes().to_vec(),
            Message::AntVersion(m) => m.as_bytes().to_vec(),
            Message::Capabilities(m) => m.as_bytes().to_vec(),
            Message::SerialNumber(m) => m.as_bytes().to_vec(),
            Message::Unimplemented { data, .. } => data.clone(),
        }
    }

    /// Channel (or network, for `SetNetworkKey`) this message addresses.
    #[must_use]
    pub fn channel(&self) -> Option<u8> {
        Some(match self {
            Message::AssignChannel(m) => m.channel_number,
            Message::UnassignChannel(m) | Message::OpenChannel(m) | Message::CloseChannel(m) => {
                m.channel_number
            }
            Message::SetChannelId(m) | Message::ChannelId(m) => m.channel_number,
            Message::SetChannelPeriod(m) => m.channel_number,
            Message::SetChannelSearchTimeout(m) => m.channel_number,
            Message::SetChannelRfFreq(m) => m.channel_number,
            Message::SetNetworkKey(m) => m.network_number,
            Message::SetSearchWaveform(m) => m.channel_number,
            Message::RequestMessage(m) => m.channel_number,
            Message::BroadcastData(m)
            | Message::AcknowledgedData(m)
            | Message::BurstTransferData(m) => m.channel(),
            Message::ChannelEvent(m) => m.channel_number,
            Message::ChannelStatus(m) => m.channel_number,
            Message::ResetSystem(_)
            | Message::StartupMessage(_)
            | Message::SerialError(_)
            | Message::AntVersion(_)
            | Message::Capabilities(_)
            | Message::SerialNumber(_)
            | Message::Unimplemented { .. } => return None,
        })
    }

    #[must_use]
    pub fn reset_system() -> Self {
        Message::ResetSystem(ResetSystem::default())
    }

    #[must_use]
    pub fn request(channel_number: u8, msg_id: u8) -> Self {
        Message::RequestMessage(RequestMessage {
            channel_number,
            msg_id,
        })
    }

    #[must_use]
    pub fn channel_event(channel_number: u8, msg_id: u8, code: EventCode) -> Self {
        Message::ChannelEvent(ChannelEvent {
            channel_number,
            msg_id,
            msg_code: code.0,
        })
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::ChannelEvent(ev) => write!(
                f,
                "ChannelEvent(channel {}, msg {:#04x}, {})",
                ev.channel_number,
                ev.msg_id,
                ev.code()
            ),
            Message::Unimplemented { id, data } => {
                write!(f, "Unimplemented({id:#04x}, {data:02x?})")
            }
            other => write!(f, "{other:?}"),
        }
    }
}
