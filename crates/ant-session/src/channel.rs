use std::{fmt, sync::Arc, time::Duration};

use ant_core::{
    AntError, Message, RetryPolicy,
    message::{
        AssignChannel, ChannelData, ChannelId, ChannelNumber, ChannelPeriod, ChannelRfFreq,
        ChannelSearchTimeout, ChannelStatus, NetworkKey, SearchWaveform, id,
    },
};

use crate::session::{DataKind, Engine, Reply, Request};

/// Handle to one of the device's channels. Cloning is cheap; every clone
/// drives the same hardware channel.
#[derive(Clone)]
pub struct Channel {
    number: u8,
    engine: Arc<Engine>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub const BIDIRECTIONAL_RECEIVE: u8 = 0x00;
    pub const BIDIRECTIONAL_TRANSMIT: u8 = 0x10;
    pub const SHARED_BIDIRECTIONAL_RECEIVE: u8 = 0x20;
    pub const SHARED_BIDIRECTIONAL_TRANSMIT: u8 = 0x30;
    pub const UNIDIRECTIONAL_RECEIVE_ONLY: u8 = 0x40;
    pub const UNIDIRECTIONAL_TRANSMIT_ONLY: u8 = 0x50;

    /// Largest payload of a single broadcast or acknowledged message.
    pub const MAX_PAYLOAD: usize = 8;

    pub(crate) fn new(number: u8, engine: Arc<Engine>) -> Self {
        Self { number, engine }
    }

    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    fn run(&self, request: &Request, policy: Option<RetryPolicy>) -> Result<Reply, AntError> {
        let config = self.engine.config();
        self.engine
            .execute(request, config.command_timeout, config.command_retries, policy)
    }

    fn command(&self, msg: Message) -> Result<(), AntError> {
        self.run(&Request::Send(msg), None).map(|_| ())
    }

    fn number_payload(&self) -> ChannelNumber {
        ChannelNumber {
            channel_number: self.number,
        }
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn assign(&self, channel_type: u8, network: u8) -> Result<(), AntError> {
        self.command(Message::AssignChannel(AssignChannel {
            channel_number: self.number,
            channel_type,
            network_number: network,
        }))
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn unassign(&self) -> Result<(), AntError> {
        self.command(Message::UnassignChannel(self.number_payload()))
    }

    /// Zero values act as wildcards when searching.
    ///
    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn set_id(&self, device_number: u16, device_type: u8, trans_type: u8) -> Result<(), AntError> {
        self.command(Message::SetChannelId(ChannelId::new(
            self.number,
            device_number,
            device_type,
            trans_type,
        )))
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn set_period(&self, period: u16) -> Result<(), AntError> {
        self.command(Message::SetChannelPeriod(ChannelPeriod::new(self.number, period)))
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn set_search_timeout(&self, timeout: u8) -> Result<(), AntError> {
        self.command(Message::SetChannelSearchTimeout(ChannelSearchTimeout {
            channel_number: self.number,
            timeout,
        }))
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn set_rf_freq(&self, rf_freq: u8) -> Result<(), AntError> {
        self.command(Message::SetChannelRfFreq(ChannelRfFreq {
            channel_number: self.number,
            rf_freq,
        }))
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn set_search_waveform(&self, waveform: u16) -> Result<(), AntError> {
        self.command(Message::SetSearchWaveform(SearchWaveform::new(
            self.number,
            waveform,
        )))
    }

    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn open(&self) -> Result<(), AntError> {
        self.command(Message::OpenChannel(self.number_payload()))
    }

    /// Returns once the device reports the channel closed.
    ///
    /// # Errors
    /// Fails if the device rejects the command or does not answer.
    pub fn close(&self) -> Result<(), AntError> {
        self.command(Message::CloseChannel(self.number_payload()))
    }

    /// # Errors
    /// Fails if the device does not answer.
    pub fn get_status(&self) -> Result<ChannelStatus, AntError> {
        match self.engine.request(self.number, id::CHANNEL_STATUS)? {
            Message::ChannelStatus(status) => Ok(status),
            msg => Err(AntError::UnexpectedReply { msg_id: msg.id() }),
        }
    }

    /// Id of the device this channel is paired with.
    ///
    /// # Errors
    /// Fails if the device does not answer.
    pub fn get_id(&self) -> Result<ChannelId, AntError> {
        match self.engine.request(self.number, id::CHANNEL_ID)? {
            Message::ChannelId(channel_id) => Ok(channel_id),
            msg => Err(AntError::UnexpectedReply { msg_id: msg.id() }),
        }
    }

    fn data(&self, data: &[u8]) -> Result<ChannelData, AntError> {
        if data.len() > Self::MAX_PAYLOAD {
            return Err(AntError::PayloadTooLarge {
                len: data.len(),
                max: Self::MAX_PAYLOAD,
            });
        }
        let mut block = [0; 8];
        block[..data.len()].copy_from_slice(data);
        Ok(ChannelData::new(self.number, block))
    }

    /// Queues `data` for the next broadcast slot, zero padded.
    ///
    /// # Errors
    /// Fails on payloads over eight bytes or if the device does not confirm
    /// the transmission.
    pub fn send_broadcast(&self, data: &[u8]) -> Result<(), AntError> {
        self.command(Message::BroadcastData(self.data(data)?))
    }

    /// Sends `data` and waits for the peer to acknowledge it. In `direct`
    /// mode the message is written immediately, even while another command
    /// is outstanding, and nothing is awaited; for best effort sends such as
    /// a final disconnect.
    ///
    /// # Errors
    /// Fails on payloads over eight bytes or if the transfer fails.
    pub fn send_acknowledged(&self, data: &[u8], direct: bool) -> Result<(), AntError> {
        let msg = Message::AcknowledgedData(self.data(data)?);
        if direct {
            self.engine.write(&msg)
        } else {
            self.command(msg)
        }
    }

    /// # Errors
    /// Fails if the transfer fails.
    pub fn send_burst(&self, data: &[u8]) -> Result<(), AntError> {
        self.run(
            &Request::Burst {
                channel: self.number,
                data: data.to_vec(),
            },
            None,
        )
        .map(|_| ())
    }

    /// Sends `data` acknowledged if it fits in one message, as a burst
    /// otherwise.
    ///
    /// A timed out write may still have reached the peer, so timeouts are not
    /// retried; see [`Channel::write_with`].
    ///
    /// # Errors
    /// Fails if the transfer fails.
    pub fn write(&self, data: &[u8]) -> Result<(), AntError> {
        self.write_inner(data, None)
    }

    /// Like [`Channel::write`], retrying according to `policy`.
    /// [`RetryPolicy::OnTxFailureOrTimeout`] gives at least once delivery.
    ///
    /// # Errors
    /// Fails if the transfer fails.
    pub fn write_with(&self, data: &[u8], policy: RetryPolicy) -> Result<(), AntError> {
        self.write_inner(data, Some(policy))
    }

    fn write_inner(&self, data: &[u8], policy: Option<RetryPolicy>) -> Result<(), AntError> {
        let request = if data.len() <= Self::MAX_PAYLOAD {
            Request::Send(Message::AcknowledgedData(self.data(data)?))
        } else {
            Request::Burst {
                channel: self.number,
                data: data.to_vec(),
            }
        };
        self.run(&request, policy).map(|_| ())
    }

    fn recv(&self, kinds: &[DataKind], timeout: Duration) -> Result<Vec<u8>, AntError> {
        let request = Request::Read {
            channel: self.number,
            kinds: kinds.to_vec(),
        };
        match self.engine.execute(&request, timeout, 0, None)? {
            Reply::Data { data, .. } => Ok(data),
            Reply::Message(msg) => Err(AntError::UnexpectedReply { msg_id: msg.id() }),
        }
    }

    /// # Errors
    /// [`AntError::Timeout`] if nothing arrives, [`AntError::ChannelClosed`]
    /// if the channel stops receiving first.
    pub fn recv_broadcast(&self, timeout: Duration) -> Result<Vec<u8>, AntError> {
        self.recv(&[DataKind::Broadcast], timeout)
    }

    /// Forgets buffered `kind` data, such as a broadcast heard before the
    /// channel was retuned. Returns whether anything was dropped.
    #[must_use]
    pub fn discard(&self, kind: DataKind) -> bool {
        self.engine.discard(self.number, kind)
    }

    /// # Errors
    /// [`AntError::Timeout`] if nothing arrives, [`AntError::ChannelClosed`]
    /// if the channel stops receiving first.
    pub fn recv_acknowledged(&self, timeout: Duration) -> Result<Vec<u8>, AntError> {
        self.recv(&[DataKind::Acknowledged], timeout)
    }

    /// # Errors
    /// [`AntError::Timeout`] if nothing arrives, [`AntError::ChannelClosed`]
    /// if the channel stops receiving first.
    pub fn recv_burst(&self, timeout: Duration) -> Result<Vec<u8>, AntError> {
        self.recv(&[DataKind::Burst], timeout)
    }

    /// Next burst or acknowledged payload, whichever is available.
    ///
    /// # Errors
    /// [`AntError::Timeout`] if nothing arrives, [`AntError::ChannelClosed`]
    /// if the channel stops receiving first.
    pub fn read(&self, timeout: Duration) -> Result<Vec<u8>, AntError> {
        self.recv(&[DataKind::Burst, DataKind::Acknowledged], timeout)
    }
}

/// Handle to one of the device's network key slots.
#[derive(Clone)]
pub struct Network {
    number: u8,
    engine: Arc<Engine>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

impl Network {
    pub(crate) fn new(number: u8, engine: Arc<Engine>) -> Self {
        Self { number, engine }
    }

    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// # Errors
    /// Fails if the device rejects the key or does not answer.
    pub fn set_key(&self, key: [u8; 8]) -> Result<(), AntError> {
        let config = self.engine.config();
        self.engine
            .execute(
                &Request::Send(Message::SetNetworkKey(NetworkKey {
                    network_number: self.number,
                    key,
                })),
                config.command_timeout,
                config.command_retries,
                None,
            )
            .map(|_| ())
    }
}
