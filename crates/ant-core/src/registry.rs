//! Catalog of supported ANT messages.
//!
//! Each [`Descriptor`] pairs a message id and direction with its payload size,
//! a decoder, and the policies the session engine applies to it: when to
//! retry, which inbound message answers it, and whether that answer is a
//! success. The table is built once and shared read-only.

use std::{collections::HashMap, time::Duration};

use zerocopy::FromBytes;

use crate::{
    AntError, EventCode, Message,
    message::{
        AntVersion, AssignChannel, Capabilities, ChannelData, ChannelEvent, ChannelId,
        ChannelNumber, ChannelPeriod, ChannelRfFreq, ChannelSearchTimeout, ChannelStatus,
        EVENT_MSG_ID, NetworkKey, RequestMessage, ResetSystem, SearchWaveform, SerialError,
        SerialNumber, StartupMessage, id,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// When a failed command is issued again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    Never,
    Always,
    OnTxFailure,
    OnTxFailureOrTimeout,
    /// Retry transmit failures after [`RetryPolicy::BACKOFF`]; the peer may
    /// just be busy.
    OnTxFailureWithBackoff,
}

impl RetryPolicy {
    pub const BACKOFF: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn should_retry(self, error: &AntError) -> bool {
        if matches!(error, AntError::SessionClosed | AntError::CommandOutstanding) {
            return false;
        }
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
            RetryPolicy::OnTxFailure | RetryPolicy::OnTxFailureWithBackoff => {
                *error == AntError::TxFailure
            }
            RetryPolicy::OnTxFailureOrTimeout => {
                matches!(error, AntError::TxFailure | AntError::Timeout)
            }
        }
    }

    #[must_use]
    pub fn backoff(self) -> Option<Duration> {
        (self == RetryPolicy::OnTxFailureWithBackoff).then_some(Self::BACKOFF)
    }
}

/// Which inbound message completes an outstanding request.
#[derive(Copy, Clone, Debug)]
pub enum Matcher {
    /// Never completed by a reply.
    None,
    /// A channel response echoing the request's id on the same channel.
    ChannelResponse,
    /// The message named by a `RequestMessage`, or an error response to it.
    Requested,
    /// The startup message following a reset.
    Startup,
    /// `EVENT_TX` for a broadcast, or an error response.
    Broadcast,
    /// Transfer completed/failed events for acknowledged and burst sends.
    Transfer,
    Custom(fn(&Message, &Message) -> bool),
}

impl Matcher {
    #[must_use]
    pub fn matches(self, request: &Message, reply: &Message) -> bool {
        match self {
            Matcher::None => false,
            Matcher::ChannelResponse => response_to(request, reply).is_some(),
            Matcher::Requested => {
                let Message::RequestMessage(RequestMessage {
                    channel_number,
                    msg_id,
                }) = request
                else {
                    return false;
                };
                if response_to(request, reply).is_some() {
                    return true;
                }
                reply.id() == *msg_id
                    && reply
                        .channel()
                        .is_none_or(|channel| channel == *channel_number)
            }
            Matcher::Startup => matches!(reply, Message::StartupMessage(_)),
            Matcher::Broadcast => {
                channel_event(request, reply, &[EventCode::EVENT_TX])
                    || response_to(request, reply).is_some_and(|ev| ev.msg_code != 0)
            }
            Matcher::Transfer => {
                channel_event(
                    request,
                    reply,
                    &[
                        EventCode::EVENT_TRANSFER_TX_COMPLETED,
                        EventCode::EVENT_TRANSFER_TX_FAILED,
                    ],
                ) || response_to(request, reply).is_some_and(|ev| ev.msg_code != 0)
            }
            Matcher::Custom(f) => f(request, reply),
        }
    }
}

/// Decides whether a matched reply is a success.
#[derive(Copy, Clone, Debug)]
pub enum Validator {
    None,
    /// Any channel event with a code other than `RESPONSE_NO_ERROR` (or
    /// `EVENT_TX`/`EVENT_TRANSFER_TX_COMPLETED` for sends) is an error.
    ResponseCode,
    Custom(fn(&Message, &Message) -> Result<(), AntError>),
}

impl Validator {
    /// # Errors
    /// Returns the error the reply reports.
    pub fn validate(self, request: &Message, reply: &Message) -> Result<(), AntError> {
        match self {
            Validator::None => Ok(()),
            Validator::ResponseCode => match reply {
                Message::ChannelEvent(ev) => match ev.code() {
                    EventCode::RESPONSE_NO_ERROR
                    | EventCode::EVENT_TX
                    | EventCode::EVENT_TRANSFER_TX_COMPLETED => Ok(()),
                    code => Err(AntError::from_code(request.id(), code)),
                },
                _ => Ok(()),
            },
            Validator::Custom(f) => f(request, reply),
        }
    }
}

/// Static metadata for one message type in one direction.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub name: &'static str,
    pub id: u8,
    pub direction: Direction,
    /// Packed payload size. Inbound payloads may be longer; trailing bytes
    /// are ignored.
    pub size: usize,
    pub decode: fn(&[u8]) -> Option<Message>,
    pub retry: RetryPolicy,
    pub matcher: Matcher,
    pub validator: Validator,
}

impl Descriptor {
    fn outbound(
        name: &'static str,
        id: u8,
        size: usize,
        decode: fn(&[u8]) -> Option<Message>,
    ) -> Self {
        Self {
            name,
            id,
            direction: Direction::HostToDevice,
            size,
            decode,
            retry: RetryPolicy::OnTxFailureOrTimeout,
            matcher: Matcher::ChannelResponse,
            validator: Validator::ResponseCode,
        }
    }

    fn inbound(
        name: &'static str,
        id: u8,
        size: usize,
        decode: fn(&[u8]) -> Option<Message>,
    ) -> Self {
        Self {
            name,
            id,
            direction: Direction::DeviceToHost,
            size,
            decode,
            retry: RetryPolicy::Never,
            matcher: Matcher::None,
            validator: Validator::None,
        }
    }

    fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = matcher;
        self
    }

    fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }
}

/// Immutable table of [`Descriptor`]s, one per id and direction.
#[derive(Clone, Debug)]
pub struct Registry {
    descriptors: HashMap<(Direction, u8), Descriptor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Builds the table of every message this crate understands.
    #[must_use]
    #[expect(clippy::too_many_lines, reason = "flat declarative table")]
    pub fn new() -> Self {
        use Descriptor as D;
        use RetryPolicy as R;

        let table = [
            D::outbound("RESET_SYSTEM", id::RESET_SYSTEM, 1, |p| {
                read::<ResetSystem>(p).map(Message::ResetSystem)
            })
            .retry(R::Never)
            .matcher(Matcher::Startup)
            .validator(Validator::None),
            D::outbound("ASSIGN_CHANNEL", id::ASSIGN_CHANNEL, 3, |p| {
                read::<AssignChannel>(p).map(Message::AssignChannel)
            }),
            D::outbound("UNASSIGN_CHANNEL", id::UNASSIGN_CHANNEL, 1, |p| {
                read::<ChannelNumber>(p).map(Message::UnassignChannel)
            }),
            D::outbound("SET_CHANNEL_ID", id::CHANNEL_ID, 5, |p| {
                read::<ChannelId>(p).map(Message::SetChannelId)
            }),
            D::outbound("SET_CHANNEL_PERIOD", id::SET_CHANNEL_PERIOD, 3, |p| {
                read::<ChannelPeriod>(p).map(Message::SetChannelPeriod)
            }),
            D::outbound("SET_CHANNEL_SEARCH_TIMEOUT", id::SET_CHANNEL_SEARCH_TIMEOUT, 2, |p| {
                read::<ChannelSearchTimeout>(p).map(Message::SetChannelSearchTimeout)
            }),
            D::outbound("SET_CHANNEL_RF_FREQ", id::SET_CHANNEL_RF_FREQ, 2, |p| {
                read::<ChannelRfFreq>(p).map(Message::SetChannelRfFreq)
            }),
            D::outbound("SET_NETWORK_KEY", id::SET_NETWORK_KEY, 9, |p| {
                read::<NetworkKey>(p).map(Message::SetNetworkKey)
            }),
            D::outbound("SET_SEARCH_WAVEFORM", id::SET_SEARCH_WAVEFORM, 3, |p| {
                read::<SearchWaveform>(p).map(Message::SetSearchWaveform)
            }),
            D::outbound("OPEN_CHANNEL", id::OPEN_CHANNEL, 1, |p| {
                read::<ChannelNumber>(p).map(Message::OpenChannel)
            }),
            D::outbound("CLOSE_CHANNEL", id::CLOSE_CHANNEL, 1, |p| {
                read::<ChannelNumber>(p).map(Message::CloseChannel)
            })
            .matcher(Matcher::Custom(close_matcher)),
            D::outbound("REQUEST_MESSAGE", id::REQUEST_MESSAGE, 2, |p| {
                read::<RequestMessage>(p).map(Message::RequestMessage)
            })
            .matcher(Matcher::Requested),
            D::outbound("BROADCAST_DATA", id::BROADCAST_DATA, 9, |p| {
                read::<ChannelData>(p).map(Message::BroadcastData)
            })
            .retry(R::Always)
            .matcher(Matcher::Broadcast),
            D::outbound("ACKNOWLEDGED_DATA", id::ACKNOWLEDGED_DATA, 9, |p| {
                read::<ChannelData>(p).map(Message::AcknowledgedData)
            })
            .retry(R::OnTxFailureWithBackoff)
            .matcher(Matcher::Transfer),
            D::outbound("BURST_TRANSFER_DATA", id::BURST_TRANSFER_DATA, 9, |p| {
                read::<ChannelData>(p).map(Message::BurstTransferData)
            })
            .retry(R::OnTxFailureWithBackoff)
            .matcher(Matcher::Transfer),
            D::inbound("STARTUP_MESSAGE", id::STARTUP_MESSAGE, 1, |p| {
                read::<StartupMessage>(p).map(Message::StartupMessage)
            }),
            D::inbound("SERIAL_ERROR", id::SERIAL_ERROR, 1, |p| {
                read::<SerialError>(p).map(Message::SerialError)
            }),
            D::inbound("CHANNEL_EVENT", id::CHANNEL_EVENT, 3, |p| {
                read::<ChannelEvent>(p).map(Message::ChannelEvent)
            }),
            D::inbound("CHANNEL_STATUS", id::CHANNEL_STATUS, 2, |p| {
                read::<ChannelStatus>(p).map(Message::ChannelStatus)
            }),
            D::inbound("CHANNEL_ID", id::CHANNEL_ID, 5, |p| {
                read::<ChannelId>(p).map(Message::ChannelId)
            }),
            D::inbound("ANT_VERSION", id::ANT_VERSION, 9, |p| {
                (p.len() >= 9).then(|| Message::AntVersion(AntVersion::from_payload(p)))
            }),
            D::inbound("CAPABILITIES", id::CAPABILITIES, 4, |p| {
                read::<Capabilities>(p).map(Message::Capabilities)
            }),
            D::inbound("SERIAL_NUMBER", id::SERIAL_NUMBER, 4, |p| {
                read::<SerialNumber>(p).map(Message::SerialNumber)
            }),
            D::inbound("BROADCAST_DATA", id::BROADCAST_DATA, 9, |p| {
                read::<ChannelData>(p).map(Message::BroadcastData)
            }),
            D::inbound("ACKNOWLEDGED_DATA", id::ACKNOWLEDGED_DATA, 9, |p| {
                read::<ChannelData>(p).map(Message::AcknowledgedData)
            }),
            D::inbound("BURST_TRANSFER_DATA", id::BURST_TRANSFER_DATA, 9, |p| {
                read::<ChannelData>(p).map(Message::BurstTransferData)
            }),
        ];

        let mut descriptors = HashMap::with_capacity(table.len());
        for descriptor in table {
            let previous = descriptors.insert((descriptor.direction, descriptor.id), descriptor);
            debug_assert!(previous.is_none(), "duplicate message descriptor");
        }
        Self { descriptors }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.values()
    }

    #[must_use]
    pub fn get(&self, direction: Direction, id: u8) -> Option<&Descriptor> {
        self.descriptors.get(&(direction, id))
    }

    /// Descriptor used to send `msg` to the device.
    #[must_use]
    pub fn outbound(&self, msg: &Message) -> Option<&Descriptor> {
        self.get(Direction::HostToDevice, msg.id())
    }

    /// Whether `reply` completes `request`.
    ///
    /// A channel closed event on the request's channel completes any request,
    /// so that nothing waits on a channel that went away.
    #[must_use]
    pub fn matches(&self, request: &Message, reply: &Message) -> bool {
        if is_channel_closed(request, reply) {
            return true;
        }
        self.outbound(request)
            .is_some_and(|d| d.matcher.matches(request, reply))
    }

    /// # Errors
    /// Returns the failure `reply` reports for `request`.
    pub fn validate(&self, request: &Message, reply: &Message) -> Result<(), AntError> {
        if is_channel_closed(request, reply) {
            return if matches!(request, Message::CloseChannel(_)) {
                Ok(())
            } else {
                Err(AntError::ChannelClosed)
            };
        }
        self.outbound(request)
            .map_or(Ok(()), |d| d.validator.validate(request, reply))
    }
}

fn read<T: FromBytes>(payload: &[u8]) -> Option<T> {
    T::read_from_prefix(payload).ok().map(|(value, _rest)| value)
}

/// The channel response to `request`, if `reply` is one.
fn response_to<'a>(request: &Message, reply: &'a Message) -> Option<&'a ChannelEvent> {
    match reply {
        Message::ChannelEvent(ev)
            if ev.msg_id == request.id() && Some(ev.channel_number) == request.channel() =>
        {
            Some(ev)
        }
        _ => None,
    }
}

fn channel_event(request: &Message, reply: &Message, codes: &[EventCode]) -> bool {
    matches!(reply, Message::ChannelEvent(ev)
        if ev.is_event()
            && Some(ev.channel_number) == request.channel()
            && codes.contains(&ev.code()))
}

fn is_channel_closed(request: &Message, reply: &Message) -> bool {
    !matches!(request, Message::SetNetworkKey(_))
        && channel_event(request, reply, &[EventCode::EVENT_CHANNEL_CLOSED])
}

/// Closing completes on the closed event, or on an error response.
fn close_matcher(request: &Message, reply: &Message) -> bool {
    response_to(request, reply).is_some_and(|ev| ev.msg_code != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(channel: u8) -> Message {
        Message::OpenChannel(ChannelNumber {
            channel_number: channel,
        })
    }

    #[test]
    fn one_descriptor_per_id_and_direction() {
        let registry = Registry::new();
        let out = registry
            .get(Direction::HostToDevice, id::CHANNEL_ID)
            .unwrap();
        let inb = registry
            .get(Direction::DeviceToHost, id::CHANNEL_ID)
            .unwrap();
        assert_eq!(out.name, "SET_CHANNEL_ID");
        assert_eq!(inb.name, "CHANNEL_ID");
    }

    #[test]
    fn response_matches_same_channel_only() {
        let registry = Registry::new();
        let ok = Message::channel_event(0, id::OPEN_CHANNEL, EventCode::RESPONSE_NO_ERROR);
        let other = Message::channel_event(1, id::OPEN_CHANNEL, EventCode::RESPONSE_NO_ERROR);
        assert!(registry.matches(&open(0), &ok));
        assert!(!registry.matches(&open(0), &other));
        assert_eq!(registry.validate(&open(0), &ok), Ok(()));
    }

    #[test]
    fn error_response_is_device_error() {
        let registry = Registry::new();
        let reply = Message::channel_event(0, id::OPEN_CHANNEL, EventCode::CHANNEL_IN_WRONG_STATE);
        assert!(registry.matches(&open(0), &reply));
        assert_eq!(
            registry.validate(&open(0), &reply),
            Err(AntError::Device {
                msg_id: id::OPEN_CHANNEL,
                code: EventCode::CHANNEL_IN_WRONG_STATE
            })
        );
    }

    #[test]
    fn requested_message_matches_reply() {
        let registry = Registry::new();
        let request = Message::request(0, id::CAPABILITIES);
        let reply = Message::Capabilities(Capabilities {
            max_channels: 8,
            max_networks: 3,
            standard_options: 0,
            advanced_options: 0,
        });
        assert!(registry.matches(&request, &reply));
        let status = Message::request(2, id::CHANNEL_STATUS);
        let wrong_channel = Message::ChannelStatus(ChannelStatus {
            channel_number: 1,
            status: 3,
        });
        assert!(!registry.matches(&status, &wrong_channel));
    }

    #[test]
    fn channel_closed_completes_everything() {
        let registry = Registry::new();
        let closed = Message::channel_event(0, EVENT_MSG_ID, EventCode::EVENT_CHANNEL_CLOSED);
        let ack = Message::AcknowledgedData(ChannelData::new(0, [0; 8]));
        assert!(registry.matches(&ack, &closed));
        assert_eq!(registry.validate(&ack, &closed), Err(AntError::ChannelClosed));

        let close = Message::CloseChannel(ChannelNumber { channel_number: 0 });
        let response = Message::channel_event(0, id::CLOSE_CHANNEL, EventCode::RESPONSE_NO_ERROR);
        assert!(!registry.matches(&close, &response));
        assert!(registry.matches(&close, &closed));
        assert_eq!(registry.validate(&close, &closed), Ok(()));
    }

    #[test]
    fn transfer_failure() {
        let registry = Registry::new();
        let ack = Message::AcknowledgedData(ChannelData::new(0, [0; 8]));
        let failed = Message::channel_event(0, EVENT_MSG_ID, EventCode::EVENT_TRANSFER_TX_FAILED);
        let done = Message::channel_event(0, EVENT_MSG_ID, EventCode::EVENT_TRANSFER_TX_COMPLETED);
        assert!(registry.matches(&ack, &failed));
        assert_eq!(registry.validate(&ack, &failed), Err(AntError::TxFailure));
        assert_eq!(registry.validate(&ack, &done), Ok(()));
    }

    #[test]
    fn retry_policies() {
        assert!(!RetryPolicy::Never.should_retry(&AntError::TxFailure));
        assert!(RetryPolicy::Always.should_retry(&AntError::Timeout));
        assert!(!RetryPolicy::Always.should_retry(&AntError::SessionClosed));
        assert!(RetryPolicy::OnTxFailure.should_retry(&AntError::TxFailure));
        assert!(!RetryPolicy::OnTxFailure.should_retry(&AntError::Timeout));
        assert!(RetryPolicy::OnTxFailureOrTimeout.should_retry(&AntError::Timeout));
        assert_eq!(
            RetryPolicy::OnTxFailureWithBackoff.backoff(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(RetryPolicy::OnTxFailure.backoff(), None);
    }
}
