//! Session engine.
//!
//! A dedicated reader thread owns the read side of the transport, decodes
//! frames and completes the single outstanding command. Callers block in
//! [`Session::execute`] on a oneshot channel until the reader delivers an
//! outcome or the deadline passes. Data that arrives while nobody is reading
//! is kept in a small per-channel buffer.

use std::{
    mem,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ant_core::{
    AntError, Codec, EventCode, Message, Registry, RetryPolicy, SessionConfig, Tokenizer,
    message::{AntVersion, Capabilities, ChannelData, ChannelState, id},
};
use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, trace, warn};

use crate::{Channel, Network, Transport, TransportError};

/// Kind of data a channel receives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataKind {
    Broadcast,
    Acknowledged,
    Burst,
}

/// A unit of work for the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// A message completed by the reply its registry entry describes.
    Send(Message),
    /// A payload of any length, sent as a burst of eight byte packets.
    Burst { channel: u8, data: Vec<u8> },
    /// Waits until data of one of `kinds` is buffered for `channel`, or the
    /// channel stops searching and tracking.
    Read { channel: u8, kinds: Vec<DataKind> },
}

impl Request {
    /// The message written for this request, whose reply completes it.
    fn message(&self) -> Message {
        match self {
            Request::Send(msg) => msg.clone(),
            Request::Burst { channel, data } => {
                let mut block = [0; 8];
                let len = data.len().min(8);
                block[..len].copy_from_slice(&data[..len]);
                let last = data.len() <= 8;
                Message::BurstTransferData(ChannelData::burst_packet(*channel, 0, last, block))
            }
            Request::Read { channel, .. } => Message::request(*channel, id::CHANNEL_STATUS),
        }
    }

    fn retry_policy(&self, registry: &Registry) -> RetryPolicy {
        match self {
            Request::Read { .. } => RetryPolicy::Never,
            request => registry
                .outbound(&request.message())
                .map_or(RetryPolicy::Never, |d| d.retry),
        }
    }
}

/// What completed a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Message(Message),
    Data { kind: DataKind, data: Vec<u8> },
}

type Outcome = Result<Reply, AntError>;

/// Splits `data` into burst packets. The first packet has sequence zero, the
/// following ones cycle through 1, 2, 3; the final one carries the last flag.
pub(crate) fn burst_packets(channel: u8, data: &[u8]) -> Vec<ChannelData> {
    let count = data.len().div_ceil(8).max(1);
    let mut sequence = 0;
    (0..count)
        .map(|i| {
            let mut block = [0; 8];
            if let Some(chunk) = data.chunks(8).nth(i) {
                block[..chunk.len()].copy_from_slice(chunk);
            }
            let packet = ChannelData::burst_packet(channel, sequence, i + 1 == count, block);
            sequence = if sequence == 3 { 1 } else { sequence + 1 };
            packet
        })
        .collect()
}

#[derive(Debug, Default)]
struct ChannelBuffer {
    broadcast: Option<Vec<u8>>,
    acknowledged: Option<Vec<u8>>,
    burst: Option<Vec<u8>>,
    /// Burst packets received so far.
    staging: Vec<u8>,
}

impl ChannelBuffer {
    fn slot(&mut self, kind: DataKind) -> &mut Option<Vec<u8>> {
        match kind {
            DataKind::Broadcast => &mut self.broadcast,
            DataKind::Acknowledged => &mut self.acknowledged,
            DataKind::Burst => &mut self.burst,
        }
    }

    fn take(&mut self, kinds: &[DataKind]) -> Option<(DataKind, Vec<u8>)> {
        kinds
            .iter()
            .find_map(|kind| self.slot(*kind).take().map(|data| (*kind, data)))
    }
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    request: Request,
    message: Message,
    deadline: Instant,
    reply: Sender<Outcome>,
}

#[derive(Debug, Default)]
struct EngineState {
    pending: Option<Pending>,
    buffers: Vec<ChannelBuffer>,
    generation: u64,
}

impl EngineState {
    fn buffer(&mut self, msg: &Message) {
        let Some(buffer) = msg
            .channel()
            .and_then(|channel| self.buffers.get_mut(usize::from(channel)))
        else {
            return;
        };
        match msg {
            Message::BroadcastData(data) => buffer.broadcast = Some(data.data.to_vec()),
            Message::AcknowledgedData(data) => buffer.acknowledged = Some(data.data.to_vec()),
            Message::BurstTransferData(data) => {
                if data.sequence() == 0 {
                    buffer.staging.clear();
                }
                buffer.staging.extend_from_slice(&data.data);
                if data.is_last() {
                    buffer.burst = Some(mem::take(&mut buffer.staging));
                }
            }
            Message::ChannelEvent(ev) if ev.is_event() => match ev.code() {
                EventCode::EVENT_TRANSFER_RX_FAILED => {
                    debug!("burst on channel {} failed", ev.channel_number);
                    buffer.staging.clear();
                }
                // a closed channel broadcasts nothing; acknowledged and burst
                // data stay readable
                EventCode::EVENT_CHANNEL_CLOSED => {
                    buffer.broadcast = None;
                    buffer.staging.clear();
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn outcome(&mut self, registry: &Registry, msg: &Message) -> Option<Outcome> {
        let Self {
            pending, buffers, ..
        } = self;
        let pending = pending.as_ref()?;
        match &pending.request {
            Request::Read { channel, kinds } => {
                let buffer = buffers.get_mut(usize::from(*channel));
                read_outcome(buffer, *channel, kinds, msg)
            }
            Request::Send(_) | Request::Burst { .. } => registry
                .matches(&pending.message, msg)
                .then(|| {
                    registry
                        .validate(&pending.message, msg)
                        .map(|()| Reply::Message(msg.clone()))
                }),
        }
    }

    fn complete(&mut self, outcome: Outcome) {
        if let Some(pending) = self.pending.take() {
            trace!("completing {:?} with {outcome:?}", pending.request);
            if pending.reply.send(outcome).is_err() {
                debug!("caller stopped waiting for {:?}", pending.request);
            }
        }
    }
}

fn read_outcome(
    buffer: Option<&mut ChannelBuffer>,
    channel: u8,
    kinds: &[DataKind],
    msg: &Message,
) -> Option<Outcome> {
    if let Some((kind, data)) = buffer.and_then(|b| b.take(kinds)) {
        return Some(Ok(Reply::Data { kind, data }));
    }
    match msg {
        Message::ChannelStatus(status) if status.channel_number == channel => {
            match status.state() {
                ChannelState::Searching | ChannelState::Tracking => None,
                state => {
                    debug!("channel {channel} is {state:?}, nothing left to read");
                    Some(Err(AntError::ChannelClosed))
                }
            }
        }
        Message::ChannelEvent(ev) if ev.channel_number == channel => {
            if ev.is_event() && ev.code() == EventCode::EVENT_CHANNEL_CLOSED {
                Some(Err(AntError::ChannelClosed))
            } else if ev.msg_id == id::REQUEST_MESSAGE && ev.code() != EventCode::RESPONSE_NO_ERROR
            {
                Some(Err(AntError::from_code(ev.msg_id, ev.code())))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn log_fault(msg: &Message) {
    match msg {
        Message::ChannelEvent(ev) if ev.is_event() => match ev.code() {
            EventCode::EVENT_RX_SEARCH_TIMEOUT
            | EventCode::EVENT_RX_FAIL
            | EventCode::EVENT_CHANNEL_COLLISION
            | EventCode::EVENT_SERIAL_QUE_OVERFLOW
            | EventCode::EVENT_QUE_OVERFLOW => {
                warn!("channel {}: {}", ev.channel_number, ev.code());
            }
            _ => {}
        },
        Message::SerialError(err) => warn!("device reported serial error {:#04x}", err.code),
        _ => {}
    }
}

/// State shared between callers and the reader thread.
pub(crate) struct Engine {
    transport: Arc<dyn Transport>,
    codec: Codec,
    config: SessionConfig,
    running: AtomicBool,
    state: Mutex<EngineState>,
}

impl Engine {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn has_outstanding(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Drops buffered `kind` data for `channel`, returning whether there was
    /// any.
    pub(crate) fn discard(&self, channel: u8, kind: DataKind) -> bool {
        self.lock()
            .buffers
            .get_mut(usize::from(channel))
            .and_then(|buffer| buffer.slot(kind).take())
            .is_some()
    }

    /// Runs `request`, retrying failures `policy` (or the registry's policy
    /// for the message) allows up to `retries` more times.
    pub(crate) fn execute(
        &self,
        request: &Request,
        timeout: Duration,
        retries: usize,
        policy: Option<RetryPolicy>,
    ) -> Result<Reply, AntError> {
        let policy = policy.unwrap_or_else(|| request.retry_policy(self.codec.registry()));
        let mut attempt = 0;
        loop {
            match self.attempt(request, timeout) {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < retries && policy.should_retry(&e) => {
                    attempt += 1;
                    warn!("{request:?} failed with {e}, retry {attempt} of {retries}");
                    if let Some(backoff) = policy.backoff() {
                        thread::sleep(backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attempt(&self, request: &Request, timeout: Duration) -> Outcome {
        if !self.is_running() {
            return Err(AntError::SessionClosed);
        }
        let message = request.message();
        let (reply, outcome) = bounded(1);
        let generation = {
            let mut state = self.lock();
            if state.pending.is_some() {
                return Err(AntError::CommandOutstanding);
            }
            if let Request::Read { channel, kinds } = request {
                let buffered = state
                    .buffers
                    .get_mut(usize::from(*channel))
                    .and_then(|b| b.take(kinds));
                if let Some((kind, data)) = buffered {
                    return Ok(Reply::Data { kind, data });
                }
            }
            state.generation += 1;
            state.pending = Some(Pending {
                generation: state.generation,
                request: request.clone(),
                message: message.clone(),
                deadline: Instant::now() + timeout,
                reply,
            });
            state.generation
        };

        if let Err(e) = self.write_request(request, &message) {
            let mut state = self.lock();
            if state.pending.as_ref().is_some_and(|p| p.generation == generation) {
                state.pending = None;
            }
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        {
            let mut state = self.lock();
            if let Some(pending) = state.pending.as_mut().filter(|p| p.generation == generation) {
                pending.deadline = deadline;
            }
        }

        match outcome.recv_deadline(deadline) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                let mut state = self.lock();
                if state.pending.as_ref().is_some_and(|p| p.generation == generation) {
                    state.pending = None;
                    return Err(AntError::Timeout);
                }
                // the reader completed it while we were giving up
                drop(state);
                outcome.try_recv().unwrap_or(Err(AntError::Timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AntError::SessionClosed),
        }
    }

    fn write_request(&self, request: &Request, message: &Message) -> Result<(), AntError> {
        match request {
            Request::Burst { channel, data } => {
                let packets = burst_packets(*channel, data);
                trace!("sending {} byte burst in {} packets", data.len(), packets.len());
                for packet in packets {
                    self.write(&Message::BurstTransferData(packet))?;
                }
                Ok(())
            }
            Request::Send(_) | Request::Read { .. } => self.write(message),
        }
    }

    /// Writes `msg` without waiting for a reply and without taking the
    /// outstanding command slot.
    pub(crate) fn write(&self, msg: &Message) -> Result<(), AntError> {
        let frame = self.codec.pack(msg);
        loop {
            if !self.is_running() {
                return Err(AntError::SessionClosed);
            }
            match self.transport.write(&frame, self.config.write_timeout) {
                Ok(()) => return Ok(()),
                Err(TransportError::Timeout) => debug!("write of {msg} timed out, retrying"),
                Err(e) => return Err(AntError::Transport(e.to_string())),
            }
        }
    }

    /// Sends a request and returns the message that answered it.
    pub(crate) fn request(&self, channel: u8, msg_id: u8) -> Result<Message, AntError> {
        let reply = self.execute(
            &Request::Send(Message::request(channel, msg_id)),
            self.config.command_timeout,
            self.config.command_retries,
            None,
        )?;
        match reply {
            Reply::Message(msg) if msg.id() == msg_id => Ok(msg),
            _ => Err(AntError::UnexpectedReply {
                msg_id: id::REQUEST_MESSAGE,
            }),
        }
    }

    fn dispatch(&self, msg: &Message) {
        trace!("received {msg}");
        log_fault(msg);
        let mut state = self.lock();
        state.buffer(msg);
        if let Some(outcome) = state.outcome(self.codec.registry(), msg) {
            state.complete(outcome);
        }
    }

    fn expire(&self, now: Instant) {
        let mut state = self.lock();
        if state.pending.as_ref().is_some_and(|p| p.deadline <= now) {
            state.complete(Err(AntError::Timeout));
        }
    }

    fn reset_buffers(&self, channels: usize) {
        let mut state = self.lock();
        state.buffers.clear();
        state.buffers.resize_with(channels, ChannelBuffer::default);
    }

    /// Stops the reader and fails whatever is outstanding with
    /// [`AntError::SessionClosed`].
    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        // dropping the sender wakes the waiting caller
        self.lock().pending = None;
    }
}

/// Shuts the engine down when the reader exits, by returning or unwinding,
/// so blocked callers see [`AntError::SessionClosed`].
struct ShutdownGuard<'a>(&'a Engine);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("reader thread unwinding, closing session");
        }
        self.0.shutdown();
    }
}

fn run_reader(engine: &Engine) {
    let _guard = ShutdownGuard(engine);
    let mut tokenizer = Tokenizer::default();
    while engine.is_running() {
        match engine.transport.read(engine.config.poll_interval) {
            Ok(bytes) => {
                tokenizer.push(&bytes);
                for frame in tokenizer.by_ref() {
                    if let Some(msg) = engine.codec.unpack(&frame) {
                        engine.dispatch(&msg);
                    }
                }
            }
            Err(TransportError::Timeout) => {}
            Err(e) => {
                if engine.is_running() {
                    error!("reader stopped: {e}");
                }
                break;
            }
        }
        engine.expire(Instant::now());
    }
}

/// A session with one ANT device.
pub struct Session {
    engine: Arc<Engine>,
    reader: Option<JoinHandle<()>>,
    channels: Vec<Channel>,
    networks: Vec<Network>,
}

impl Session {
    /// Starts the reader thread. Call [`Session::reset_system`] before using
    /// channels.
    ///
    /// # Errors
    /// Fails if the reader thread cannot be spawned.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> anyhow::Result<Self> {
        let engine = Arc::new(Engine {
            transport,
            codec: Codec::new(Arc::new(Registry::new())),
            config,
            running: AtomicBool::new(true),
            state: Mutex::new(EngineState::default()),
        });
        let reader = {
            let engine = engine.clone();
            thread::Builder::new()
                .name("ant-reader".to_owned())
                .spawn(move || run_reader(&engine))?
        };
        Ok(Self {
            engine,
            reader: Some(reader),
            channels: Vec::new(),
            networks: Vec::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        self.engine.config()
    }

    /// # Errors
    /// Fails with the last error once the retry policy gives up.
    pub fn execute(
        &self,
        request: &Request,
        timeout: Duration,
        retries: usize,
    ) -> Result<Reply, AntError> {
        self.engine.execute(request, timeout, retries, None)
    }

    /// Like [`Session::execute`] with an explicit retry policy.
    ///
    /// # Errors
    /// Fails with the last error once `policy` gives up.
    pub fn execute_with(
        &self,
        request: &Request,
        timeout: Duration,
        retries: usize,
        policy: RetryPolicy,
    ) -> Result<Reply, AntError> {
        self.engine.execute(request, timeout, retries, Some(policy))
    }

    /// Whether a command is waiting for its reply.
    #[must_use]
    pub fn has_outstanding(&self) -> bool {
        self.engine.has_outstanding()
    }

    /// Resets the device, then creates channel and network handles for what
    /// it reports.
    ///
    /// # Errors
    /// Fails if the reset cannot be written or capabilities are not reported.
    pub fn reset_system(&mut self) -> Result<Capabilities, AntError> {
        self.engine.write(&Message::reset_system())?;
        thread::sleep(self.engine.config.reset_delay);

        let capabilities = self.get_capabilities()?;
        debug!("device capabilities: {capabilities:?}");
        self.engine
            .reset_buffers(usize::from(capabilities.max_channels));
        self.channels = (0..capabilities.max_channels)
            .map(|number| Channel::new(number, self.engine.clone()))
            .collect();
        self.networks = (0..capabilities.max_networks)
            .map(|number| Network::new(number, self.engine.clone()))
            .collect();
        Ok(capabilities)
    }

    /// # Errors
    /// Fails if the device does not answer.
    pub fn get_capabilities(&self) -> Result<Capabilities, AntError> {
        match self.engine.request(0, id::CAPABILITIES)? {
            Message::Capabilities(capabilities) => Ok(capabilities),
            msg => Err(AntError::UnexpectedReply { msg_id: msg.id() }),
        }
    }

    /// # Errors
    /// Fails if the device does not answer.
    pub fn get_ant_version(&self) -> Result<AntVersion, AntError> {
        match self.engine.request(0, id::ANT_VERSION)? {
            Message::AntVersion(version) => Ok(version),
            msg => Err(AntError::UnexpectedReply { msg_id: msg.id() }),
        }
    }

    /// # Errors
    /// Fails if the device does not answer.
    pub fn get_serial_number(&self) -> Result<u32, AntError> {
        match self.engine.request(0, id::SERIAL_NUMBER)? {
            Message::SerialNumber(serial) => Ok(serial.serial.get()),
            msg => Err(AntError::UnexpectedReply { msg_id: msg.id() }),
        }
    }

    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    #[must_use]
    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Stops the reader thread and closes the transport. Blocked callers get
    /// [`AntError::SessionClosed`].
    pub fn close(&mut self) {
        self.engine.shutdown();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("reader thread panicked");
            }
            self.engine.transport.close();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use ant_core::message::{ChannelNumber, ChannelStatus, EVENT_MSG_ID};

    use super::*;
    use crate::transport::mock::{self, Fault, MockTransport, burst, device, event, response};

    fn open(channel: u8) -> Request {
        Request::Send(Message::OpenChannel(ChannelNumber {
            channel_number: channel,
        }))
    }

    #[test]
    fn reset_creates_handles() {
        let (session, transport) = mock::session(device);
        assert_eq!(session.channels().len(), 8);
        assert_eq!(session.networks().len(), 1);
        assert_eq!(session.channels()[7].number(), 7);
        assert_eq!(transport.written()[0], Message::reset_system());
    }

    #[test]
    fn device_information() {
        let (session, _transport) = mock::session(device);
        assert_eq!(session.get_ant_version().unwrap().to_string(), "AJK1.04RAF");
        assert_eq!(session.get_serial_number().unwrap(), 0xC0FF_EE00);
    }

    #[test]
    fn retries_until_the_policy_gives_up() {
        let (session, transport) = mock::session(|msg| match msg {
            Message::OpenChannel(_) => vec![response(msg, EventCode::EVENT_TRANSFER_TX_FAILED)],
            _ => device(msg),
        });
        let timeout = Duration::from_millis(200);
        let opens = |t: &MockTransport| t.count(|m| matches!(m, Message::OpenChannel(_)));

        let result = session.execute_with(&open(0), timeout, 3, RetryPolicy::OnTxFailure);
        assert_eq!(result, Err(AntError::TxFailure));
        assert_eq!(opens(&transport), 4);

        let result = session.execute_with(&open(0), timeout, 3, RetryPolicy::Never);
        assert_eq!(result, Err(AntError::TxFailure));
        assert_eq!(opens(&transport), 5);
    }

    #[test]
    fn device_errors_are_not_timeouts() {
        let (session, _transport) = mock::session(|msg| match msg {
            Message::OpenChannel(_) => vec![response(msg, EventCode::CHANNEL_IN_WRONG_STATE)],
            _ => device(msg),
        });
        assert_eq!(
            session.execute(&open(1), Duration::from_millis(200), 0),
            Err(AntError::Device {
                msg_id: id::OPEN_CHANNEL,
                code: EventCode::CHANNEL_IN_WRONG_STATE,
            })
        );
    }

    #[test]
    fn silent_device_times_out() {
        let (session, _transport) = mock::session(|msg| match msg {
            Message::OpenChannel(_) => Vec::new(),
            _ => device(msg),
        });
        assert_eq!(
            session.execute(&open(0), Duration::from_millis(50), 0),
            Err(AntError::Timeout)
        );
        // the slot is free again
        assert!(!session.has_outstanding());
    }

    #[test]
    fn one_command_at_a_time() {
        let (mut session, _transport) = mock::session(device);
        let channel = session.channels()[0].clone();
        let reader = thread::spawn(move || channel.recv_broadcast(Duration::from_secs(5)));
        while !session.has_outstanding() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            session.execute(&open(1), Duration::from_millis(50), 3),
            Err(AntError::CommandOutstanding)
        );
        session.close();
        assert_eq!(reader.join().unwrap(), Err(AntError::SessionClosed));
    }

    fn reader_fault_closes_session(fault: Fault) {
        let (mut session, transport) = mock::session(device);
        let channel = session.channels()[0].clone();
        let reader = thread::spawn(move || channel.recv_broadcast(Duration::from_secs(5)));
        while !session.has_outstanding() {
            thread::sleep(Duration::from_millis(1));
        }
        transport.fail(fault);
        assert_eq!(reader.join().unwrap(), Err(AntError::SessionClosed));
        assert_eq!(
            session.execute(&open(1), Duration::from_millis(50), 3),
            Err(AntError::SessionClosed)
        );
        session.close();
    }

    #[test]
    fn unplugged_device_fails_waiting_callers() {
        reader_fault_closes_session(Fault::Io);
    }

    #[test]
    fn reader_panic_fails_waiting_callers() {
        reader_fault_closes_session(Fault::Panic);
    }

    #[test]
    fn burst_is_reassembled() {
        let (session, transport) = mock::session(device);
        let payload: Vec<u8> = (0..40).collect();
        transport.inject(&burst(2, &payload));
        let data = session.channels()[2]
            .recv_burst(Duration::from_millis(500))
            .unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn failed_burst_is_discarded() {
        let (session, transport) = mock::session(device);
        let stale = burst(0, &[0xEE; 24]);
        transport.inject(&stale[..2]);
        transport.inject(&[event(0, EventCode::EVENT_TRANSFER_RX_FAILED)]);
        transport.inject(&burst(0, &[1; 16]));
        let data = session.channels()[0]
            .recv_burst(Duration::from_millis(500))
            .unwrap();
        assert_eq!(data, [1; 16]);
    }

    #[test]
    fn burst_send_is_split_into_packets() {
        let (session, transport) = mock::session(device);
        let payload: Vec<u8> = (0..30).collect();
        session.channels()[1].send_burst(&payload).unwrap();

        let packets: Vec<ChannelData> = transport
            .written()
            .into_iter()
            .filter_map(|m| match m {
                Message::BurstTransferData(packet) => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(packets.len(), 4);
        let sequences: Vec<u8> = packets.iter().map(ChannelData::sequence).collect();
        assert_eq!(sequences, [0, 1, 2, 3]);
        assert!(packets[3].is_last());
        assert!(packets.iter().all(|p| p.channel() == 1));
        let sent: Vec<u8> = packets.iter().flat_map(|p| p.data).collect();
        assert_eq!(&sent[..30], &payload[..]);
    }

    #[test]
    fn closed_channel_fails_pending_read() {
        let (session, transport) = mock::session(|msg| match msg {
            Message::RequestMessage(r) if r.msg_id == id::CHANNEL_STATUS => Vec::new(),
            _ => device(msg),
        });
        let channel = session.channels()[3].clone();
        let reader = thread::spawn(move || channel.read(Duration::from_secs(5)));
        while !session.has_outstanding() {
            thread::sleep(Duration::from_millis(1));
        }
        transport.inject(&[Message::channel_event(
            3,
            EVENT_MSG_ID,
            EventCode::EVENT_CHANNEL_CLOSED,
        )]);
        assert_eq!(reader.join().unwrap(), Err(AntError::ChannelClosed));
    }

    #[test]
    fn read_on_idle_channel_fails_fast() {
        let (session, _transport) = mock::session(|msg| match msg {
            Message::RequestMessage(r) if r.msg_id == id::CHANNEL_STATUS => {
                vec![Message::ChannelStatus(ChannelStatus {
                    channel_number: r.channel_number,
                    status: 0x01,
                })]
            }
            _ => device(msg),
        });
        assert_eq!(
            session.channels()[0].read(Duration::from_secs(5)),
            Err(AntError::ChannelClosed)
        );
    }

    #[test]
    fn buffered_data_is_read_without_a_round_trip() {
        let (session, transport) = mock::session(device);
        transport.inject(&[mock::broadcast(4, b"beacon")]);
        let channel = &session.channels()[4];
        let data = channel.recv_broadcast(Duration::from_millis(500)).unwrap();
        assert_eq!(&data[..6], b"beacon");
        let requests = |t: &MockTransport| t.count(|m| matches!(m, Message::RequestMessage(_)));
        let before = requests(&transport);
        transport.inject(&[mock::broadcast(4, b"again")]);
        thread::sleep(Duration::from_millis(50));
        channel.recv_broadcast(Duration::from_millis(500)).unwrap();
        assert_eq!(requests(&transport), before);
    }

    #[test]
    fn acknowledged_timeout_is_not_retried_by_default() {
        let (session, transport) = mock::session(|msg| match msg {
            Message::AcknowledgedData(_) => Vec::new(),
            _ => device(msg),
        });
        let acks = |t: &MockTransport| t.count(|m| matches!(m, Message::AcknowledgedData(_)));
        let channel = &session.channels()[0];

        // at most once: a timed out acknowledged write may have been applied
        assert_eq!(channel.write(b"once"), Err(AntError::Timeout));
        assert_eq!(acks(&transport), 1);

        // at least once, when the caller knows the write is idempotent
        assert_eq!(
            channel.write_with(b"again", RetryPolicy::OnTxFailureOrTimeout),
            Err(AntError::Timeout)
        );
        assert_eq!(acks(&transport), 1 + 1 + session.config().command_retries);
    }

    #[test]
    fn direct_send_bypasses_the_outstanding_slot() {
        let (session, transport) = mock::session(|msg| match msg {
            Message::OpenChannel(_) => Vec::new(),
            _ => device(msg),
        });
        let channel = session.channels()[0].clone();
        let opener = {
            let channel = channel.clone();
            thread::spawn(move || channel.open())
        };
        while !session.has_outstanding() {
            thread::sleep(Duration::from_millis(1));
        }
        channel.send_acknowledged(b"bye", true).unwrap();
        assert_eq!(
            transport.count(|m| matches!(m, Message::AcknowledgedData(_))),
            1
        );
        assert_eq!(opener.join().unwrap(), Err(AntError::Timeout));
    }
}
