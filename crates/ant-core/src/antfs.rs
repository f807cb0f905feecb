//! ANT-FS beacon and command framing, carried inside ANT data payloads.

use std::fmt::Display;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U16, U32},
};

pub const BEACON_ID: u8 = 0x43;
pub const COMMAND_ID: u8 = 0x44;

pub mod command_id {
    pub const LINK: u8 = 0x02;
    pub const DISCONNECT: u8 = 0x03;
    pub const AUTH: u8 = 0x04;
    pub const PING: u8 = 0x05;
    pub const DIRECT: u8 = 0x0D;
    /// Set on command ids sent by the client in response.
    pub const RESPONSE: u8 = 0x80;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("frame of {0} bytes is too short")]
    TooShort(usize),
    #[error("unexpected page id {0:#04x}")]
    PageId(u8),
    #[error("unknown device state {0}")]
    DeviceState(u8),
    #[error("unknown command {0:#04x}")]
    Command(u8),
    #[error("unknown auth value {0}")]
    Auth(u8),
    #[error("beacon carries no command")]
    NoCommand,
}

/// Device state advertised in every beacon.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Link,
    Authentication,
    Transport,
    Busy,
}

impl TryFrom<u8> for DeviceState {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value & 0x0F {
            0 => DeviceState::Link,
            1 => DeviceState::Authentication,
            2 => DeviceState::Transport,
            3 => DeviceState::Busy,
            other => return Err(ParseError::DeviceState(other)),
        })
    }
}

impl From<DeviceState> for u8 {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Link => 0,
            DeviceState::Authentication => 1,
            DeviceState::Transport => 2,
            DeviceState::Busy => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BeaconPage {
    page_id: u8,
    status_1: u8,
    status_2: u8,
    auth_type: u8,
    descriptor: U32,
}

const DATA_AVAILABLE: u8 = 0x20;
const UPLOAD_ENABLED: u8 = 0x10;
const PAIRING_ENABLED: u8 = 0x80;
const PERIOD_MASK: u8 = 0x07;

/// A parsed ANT-FS beacon plus whatever followed it in the same transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Beacon {
    /// Beacon period code, see [`Beacon::channel_period`].
    pub period: u8,
    pub data_available: bool,
    pub upload_enabled: bool,
    pub pairing_enabled: bool,
    pub state: DeviceState,
    pub auth_type: u8,
    pub descriptor: u32,
    pub data: Vec<u8>,
}

impl Beacon {
    pub const LEN: usize = 8;
    /// Period code meaning "same as the established channel period".
    pub const MATCH_ESTABLISHED: u8 = 7;

    /// # Errors
    /// Fails if `bytes` do not start with a beacon page.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let (page, rest) = BeaconPage::read_from_prefix(bytes)
            .map_err(|_| ParseError::TooShort(bytes.len()))?;
        if page.page_id != BEACON_ID {
            return Err(ParseError::PageId(page.page_id));
        }
        Ok(Self {
            period: page.status_1 & PERIOD_MASK,
            data_available: page.status_1 & DATA_AVAILABLE != 0,
            upload_enabled: page.status_1 & UPLOAD_ENABLED != 0,
            pairing_enabled: page.status_1 & PAIRING_ENABLED != 0,
            state: DeviceState::try_from(page.status_2)?,
            auth_type: page.auth_type,
            descriptor: page.descriptor.get(),
            data: rest.to_vec(),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut status_1 = self.period & PERIOD_MASK;
        if self.data_available {
            status_1 |= DATA_AVAILABLE;
        }
        if self.upload_enabled {
            status_1 |= UPLOAD_ENABLED;
        }
        if self.pairing_enabled {
            status_1 |= PAIRING_ENABLED;
        }
        let page = BeaconPage {
            page_id: BEACON_ID,
            status_1,
            status_2: self.state.into(),
            auth_type: self.auth_type,
            descriptor: U32::new(self.descriptor),
        };
        let mut bytes = page.as_bytes().to_vec();
        bytes.extend(&self.data);
        bytes
    }

    /// Channel period matching the advertised beacon rate.
    #[must_use]
    pub fn channel_period(&self) -> Option<u16> {
        channel_period(self.period)
    }

    /// The command frame embedded after the beacon, if any.
    #[must_use]
    pub fn command(&self) -> Option<Result<Command, ParseError>> {
        (self.data.first() == Some(&COMMAND_ID)).then(|| Command::parse(&self.data))
    }
}

/// Channel period (in 1/32768 s) for a beacon period code: 0.5, 1, 2, 4 or
/// 8 Hz. `None` for codes that keep the established period.
#[must_use]
pub fn channel_period(code: u8) -> Option<u16> {
    match code {
        0 => Some(u16::MAX),
        code @ 1..=4 => Some(32768 >> (code - 1)),
        _ => None,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthOp {
    PassThrough,
    ClientSerial,
    Pair,
    Passkey,
}

impl From<AuthOp> for u8 {
    fn from(op: AuthOp) -> Self {
        match op {
            AuthOp::PassThrough => 0,
            AuthOp::ClientSerial => 1,
            AuthOp::Pair => 2,
            AuthOp::Passkey => 3,
        }
    }
}

impl TryFrom<u8> for AuthOp {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => AuthOp::PassThrough,
            1 => AuthOp::ClientSerial,
            2 => AuthOp::Pair,
            3 => AuthOp::Passkey,
            other => return Err(ParseError::Auth(other)),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthResponse {
    /// Answer to a client serial request.
    NotApplicable,
    Accept,
    Reject,
}

impl From<AuthResponse> for u8 {
    fn from(response: AuthResponse) -> Self {
        match response {
            AuthResponse::NotApplicable => 0,
            AuthResponse::Accept => 1,
            AuthResponse::Reject => 2,
        }
    }
}

impl TryFrom<u8> for AuthResponse {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => AuthResponse::NotApplicable,
            1 => AuthResponse::Accept,
            2 => AuthResponse::Reject,
            other => return Err(ParseError::Auth(other)),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct CommandHeader {
    page_id: u8,
    command: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct LinkPayload {
    rf_freq: u8,
    period: u8,
    host_id: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct AuthPayload {
    op: u8,
    len: u8,
    id: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct DirectPayload {
    fd: U16,
    offset: U16,
    blocks: U16,
}

/// ANT-FS command frames, host requests and client responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Link {
        rf_freq: u8,
        period: u8,
        host_id: u32,
    },
    Disconnect,
    Auth {
        op: AuthOp,
        host_id: u32,
        auth: Vec<u8>,
    },
    AuthResponse {
        response: AuthResponse,
        client_id: u32,
        auth: Vec<u8>,
    },
    Ping,
    /// Opaque payload addressed by file descriptor and byte offset.
    Direct { fd: u16, offset: u16, data: Vec<u8> },
}

impl Command {
    /// # Errors
    /// Fails on a wrong page id, an unknown command or a short frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let (header, rest) = CommandHeader::read_from_prefix(bytes)
            .map_err(|_| ParseError::TooShort(bytes.len()))?;
        if header.page_id != COMMAND_ID {
            return Err(ParseError::PageId(header.page_id));
        }
        Ok(match header.command {
            command_id::LINK => {
                let (link, _) = LinkPayload::read_from_prefix(rest)
                    .map_err(|_| ParseError::TooShort(bytes.len()))?;
                Command::Link {
                    rf_freq: link.rf_freq,
                    period: link.period,
                    host_id: link.host_id.get(),
                }
            }
            command_id::DISCONNECT => Command::Disconnect,
            command_id::PING => Command::Ping,
            command_id::AUTH => {
                let (auth, data) = AuthPayload::read_from_prefix(rest)
                    .map_err(|_| ParseError::TooShort(bytes.len()))?;
                Command::Auth {
                    op: AuthOp::try_from(auth.op)?,
                    host_id: auth.id.get(),
                    auth: auth_string(data, auth.len),
                }
            }
            id if id == command_id::AUTH | command_id::RESPONSE => {
                let (auth, data) = AuthPayload::read_from_prefix(rest)
                    .map_err(|_| ParseError::TooShort(bytes.len()))?;
                Command::AuthResponse {
                    response: AuthResponse::try_from(auth.op)?,
                    client_id: auth.id.get(),
                    auth: auth_string(data, auth.len),
                }
            }
            id if id & !command_id::RESPONSE == command_id::DIRECT => {
                let (direct, data) = DirectPayload::read_from_prefix(rest)
                    .map_err(|_| ParseError::TooShort(bytes.len()))?;
                let len = (usize::from(direct.blocks.get()) * 8).min(data.len());
                Command::Direct {
                    fd: direct.fd.get(),
                    offset: direct.offset.get(),
                    data: data[..len].to_vec(),
                }
            }
            other => return Err(ParseError::Command(other)),
        })
    }

    /// Serialises the command, zero padded to a multiple of eight bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let (command, mut bytes) = match self {
            Command::Link {
                rf_freq,
                period,
                host_id,
            } => (
                command_id::LINK,
                LinkPayload {
                    rf_freq: *rf_freq,
                    period: *period,
                    host_id: U32::new(*host_id),
                }
                .as_bytes()
                .to_vec(),
            ),
            Command::Disconnect => (command_id::DISCONNECT, Vec::new()),
            Command::Ping => (command_id::PING, Vec::new()),
            Command::Auth { op, host_id, auth } => (
                command_id::AUTH,
                auth_bytes((*op).into(), *host_id, auth),
            ),
            Command::AuthResponse {
                response,
                client_id,
                auth,
            } => (
                command_id::AUTH | command_id::RESPONSE,
                auth_bytes((*response).into(), *client_id, auth),
            ),
            Command::Direct { fd, offset, data } => {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "direct payloads stay far below 512 KiB"
                )]
                let blocks = data.len().div_ceil(8) as u16;
                let mut bytes = DirectPayload {
                    fd: U16::new(*fd),
                    offset: U16::new(*offset),
                    blocks: U16::new(blocks),
                }
                .as_bytes()
                .to_vec();
                bytes.extend(data);
                (command_id::DIRECT, bytes)
            }
        };
        let mut frame = CommandHeader {
            page_id: COMMAND_ID,
            command,
        }
        .as_bytes()
        .to_vec();
        frame.append(&mut bytes);
        frame.resize(frame.len().div_ceil(8).max(1) * 8, 0);
        frame
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Direct { fd, offset, data } => write!(
                f,
                "Direct(fd {fd:#06x}, offset {offset}, {} bytes)",
                data.len()
            ),
            other => write!(f, "{other:?}"),
        }
    }
}

fn auth_bytes(op: u8, id: u32, auth: &[u8]) -> Vec<u8> {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "auth strings are limited to 255 bytes by the wire format"
    )]
    let len = auth.len().min(usize::from(u8::MAX)) as u8;
    let mut bytes = AuthPayload {
        op,
        len,
        id: U32::new(id),
    }
    .as_bytes()
    .to_vec();
    bytes.extend(&auth[..usize::from(len)]);
    bytes
}

fn auth_string(data: &[u8], len: u8) -> Vec<u8> {
    data[..usize::from(len).min(data.len())].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_bytes() {
        let bytes = [0x43, 0xA4, 0x00, 0x03, 0x01, 0x00, 0x02, 0x00];
        let beacon = Beacon::parse(&bytes).unwrap();
        assert_eq!(beacon.period, 4);
        assert!(beacon.data_available);
        assert!(beacon.pairing_enabled);
        assert!(!beacon.upload_enabled);
        assert_eq!(beacon.state, DeviceState::Link);
        assert_eq!(beacon.auth_type, 3);
        assert_eq!(beacon.descriptor, 0x0002_0001);
        assert_eq!(beacon.channel_period(), Some(4096));
        assert_eq!(beacon.to_bytes(), bytes);
    }

    #[test]
    fn beacon_rejects_other_pages() {
        assert_eq!(
            Beacon::parse(&[0x44, 0, 0, 0, 0, 0, 0, 0]),
            Err(ParseError::PageId(0x44))
        );
        assert_eq!(Beacon::parse(&[0x43, 0]), Err(ParseError::TooShort(2)));
        assert_eq!(
            Beacon::parse(&[0x43, 0, 0x0A, 0, 0, 0, 0, 0]),
            Err(ParseError::DeviceState(0x0A))
        );
    }

    #[test]
    fn link_layout() {
        let link = Command::Link {
            rf_freq: 0x12,
            period: 4,
            host_id: 0x1122_3344,
        };
        let bytes = link.to_bytes();
        assert_eq!(bytes, [0x44, 0x02, 0x12, 0x04, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(Command::parse(&bytes), Ok(link));
    }

    #[test]
    fn auth_is_padded() {
        let auth = Command::Auth {
            op: AuthOp::Pair,
            host_id: 7,
            auth: b"host".to_vec(),
        };
        let bytes = auth.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], [0x44, 0x04, 2, 4]);
        assert_eq!(Command::parse(&bytes), Ok(auth));
    }

    #[test]
    fn direct_block_count() {
        let direct = Command::Direct {
            fd: 0xFFFF,
            offset: 0,
            data: vec![1; 12],
        };
        let bytes = direct.to_bytes();
        // 8 byte header followed by two blocks
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[6..8], [2, 0]);
        let Ok(Command::Direct { data, .. }) = Command::parse(&bytes) else {
            panic!("expected direct command");
        };
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..12], [1; 12]);
    }

    #[test]
    fn embedded_auth_response() {
        let mut bytes = Beacon {
            period: 4,
            data_available: false,
            upload_enabled: false,
            pairing_enabled: false,
            state: DeviceState::Authentication,
            auth_type: 3,
            descriptor: 0,
            data: Vec::new(),
        }
        .to_bytes();
        bytes.extend(
            Command::AuthResponse {
                response: AuthResponse::Accept,
                client_id: 0xDEAD_BEEF,
                auth: vec![9; 8],
            }
            .to_bytes(),
        );
        let beacon = Beacon::parse(&bytes).unwrap();
        assert_eq!(
            beacon.command(),
            Some(Ok(Command::AuthResponse {
                response: AuthResponse::Accept,
                client_id: 0xDEAD_BEEF,
                auth: vec![9; 8],
            }))
        );
    }
}
