//! ANT-FS host.
//!
//! Drives one channel through search, link, authentication and transport.
//! Every beacon the client sends is fed to the [`HostMachine`]; each step
//! checks the machine landed where the handshake requires and fails with
//! [`HostError::UnexpectedState`] otherwise.

use std::time::{Duration, Instant};

use ant_core::{
    AntError, HostConfig, HostContext, HostEvent, HostMachine, KnownDeviceDb, State,
    antfs::{AuthOp, AuthResponse, Beacon, Command, DeviceState, ParseError, channel_period},
};
use rand::seq::SliceRandom as _;
use tracing::{debug, trace, warn};

use crate::{Channel, DataKind, Network};

/// How long [`Host::disconnect`] listens for a last beacon.
const DISCONNECT_LISTEN: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Ant(#[from] AntError),
    #[error("malformed ANT-FS frame: {0}")]
    Parse(#[from] ParseError),
    #[error("known device store: {0}")]
    Store(anyhow::Error),
    #[error("expected {expected:?} state, host is in {actual:?}")]
    UnexpectedState { expected: State, actual: State },
    #[error("unexpected response {0}")]
    UnexpectedResponse(Command),
}

/// A device found by [`Host::search`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discovered {
    pub beacon: Beacon,
    /// Transient ANT device number the beacon was received from.
    pub device_number: u16,
    /// Pairing identifier, if the device is known.
    pub device_id: Option<u32>,
}

pub struct Host {
    channel: Channel,
    network: Network,
    db: KnownDeviceDb,
    config: HostConfig,
    machine: HostMachine,
    context: HostContext,
    device: Option<Discovered>,
}

impl Host {
    #[must_use]
    pub fn new(channel: Channel, network: Network, db: KnownDeviceDb, config: HostConfig) -> Self {
        let mut context = HostContext::default();
        let machine = HostMachine::new(&mut context);
        Self {
            channel,
            network,
            db,
            config,
            machine,
            context,
            device: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &State {
        self.machine.state()
    }

    /// The device found by the last successful search.
    #[must_use]
    pub fn device(&self) -> Option<&Discovered> {
        self.device.as_ref()
    }

    #[must_use]
    pub fn db(&self) -> &KnownDeviceDb {
        &self.db
    }

    fn handle(&mut self, event: &HostEvent) {
        self.machine.handle_with_context(event, &mut self.context);
    }

    fn expect_state(&self, expected: State) -> Result<(), HostError> {
        let actual = self.machine.state();
        if *actual == expected {
            Ok(())
        } else {
            Err(HostError::UnexpectedState {
                expected,
                actual: actual.clone(),
            })
        }
    }

    fn close_quietly(&self) {
        if let Err(e) = self.channel.close() {
            trace!("closing channel {}: {e}", self.channel.number());
        }
    }

    fn configure_search(&self) -> Result<(), AntError> {
        self.network.set_key(self.config.search_network_key)?;
        if let Err(e) = self.channel.unassign() {
            trace!("unassigning channel {}: {e}", self.channel.number());
        }
        self.channel
            .assign(Channel::BIDIRECTIONAL_RECEIVE, self.network.number())?;
        self.channel.set_id(0, 0, 0)?;
        self.channel.set_period(self.config.search_period)?;
        self.channel.set_search_timeout(self.config.search_timeout)?;
        self.channel.set_rf_freq(self.config.search_rf_freq)?;
        self.channel.set_search_waveform(self.config.search_waveform)
    }

    /// Searches for a client until `timeout` passes.
    ///
    /// With `device_id` only that paired device is accepted. Otherwise any
    /// known device is, and unknown ones too if `include_unpaired` is set.
    /// Devices without data are skipped unless `include_devices_with_no_data`
    /// is set.
    ///
    /// # Errors
    /// Fails if the channel cannot be configured or opened.
    pub fn search(
        &mut self,
        timeout: Duration,
        device_id: Option<u32>,
        include_unpaired: bool,
        include_devices_with_no_data: bool,
    ) -> Result<Option<Discovered>, HostError> {
        self.configure_search()?;
        self.device = None;
        self.handle(&HostEvent::Search);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.close_quietly();
                debug!("search timed out");
                return Ok(None);
            }
            self.channel.open()?;
            match self.channel.recv_broadcast(remaining) {
                Ok(data) => {
                    let found = self.screen(
                        &data,
                        device_id,
                        include_unpaired,
                        include_devices_with_no_data,
                    )?;
                    if let Some(found) = found {
                        debug!("found device {:#06x}", found.device_number);
                        self.handle(&HostEvent::Beacon(found.beacon.clone()));
                        self.device = Some(found.clone());
                        return Ok(Some(found));
                    }
                }
                Err(AntError::ChannelClosed | AntError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
            // once tracking the radio never reports another device
            self.close_quietly();
        }
    }

    fn screen(
        &self,
        data: &[u8],
        device_id: Option<u32>,
        include_unpaired: bool,
        include_devices_with_no_data: bool,
    ) -> Result<Option<Discovered>, HostError> {
        let beacon = match Beacon::parse(data) {
            Ok(beacon) => beacon,
            Err(e) => {
                trace!("ignoring broadcast: {e}");
                return Ok(None);
            }
        };
        if beacon.state != DeviceState::Link {
            trace!("ignoring device in {:?}", beacon.state);
            return Ok(None);
        }
        let device_number = self.channel.get_id()?.device_number.get();
        let known = self.db.get_device_id(device_number);
        let wanted = match device_id {
            Some(id) => known == Some(id),
            None => known.is_some() || include_unpaired,
        };
        if !wanted || !(beacon.data_available || include_devices_with_no_data) {
            trace!("skipping device {device_number:#06x}");
            return Ok(None);
        }
        Ok(Some(Discovered {
            beacon,
            device_number,
            device_id: known,
        }))
    }

    fn next_beacon(&mut self, timeout: Duration) -> Result<Beacon, HostError> {
        let data = self.channel.recv_broadcast(timeout)?;
        let beacon = Beacon::parse(&data)?;
        self.handle(&HostEvent::Beacon(beacon.clone()));
        Ok(beacon)
    }

    /// Reads the client's next transfer, a beacon followed by a command.
    fn transfer(&mut self, timeout: Duration) -> Result<Command, HostError> {
        let data = self.channel.read(timeout)?;
        let beacon = Beacon::parse(&data)?;
        self.handle(&HostEvent::Beacon(beacon.clone()));
        Ok(beacon.command().ok_or(ParseError::NoCommand)??)
    }

    fn auth_response(
        &mut self,
        timeout: Duration,
    ) -> Result<(AuthResponse, u32, Vec<u8>), HostError> {
        match self.transfer(timeout)? {
            Command::AuthResponse {
                response,
                client_id,
                auth,
            } => Ok((response, client_id, auth)),
            other => Err(HostError::UnexpectedResponse(other)),
        }
    }

    fn send(&self, command: &Command) -> Result<(), HostError> {
        debug!("sending {command}");
        Ok(self.channel.write(&command.to_bytes())?)
    }

    /// Moves the found device to a private frequency, leaving it in
    /// authentication.
    ///
    /// # Errors
    /// [`HostError::UnexpectedState`] unless the next beacon reports
    /// authentication.
    pub fn link(&mut self) -> Result<(), HostError> {
        self.expect_state(State::Link {})?;
        let period = self
            .context
            .beacon
            .as_ref()
            .and_then(Beacon::channel_period)
            .unwrap_or(self.config.search_period);
        self.channel.set_period(period)?;

        let rf_freq = self
            .config
            .transport_rf_freqs
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(self.config.search_rf_freq);
        self.send(&Command::Link {
            rf_freq,
            period: self.config.transport_period,
            host_id: self.config.host_id,
        })?;

        self.channel
            .set_search_timeout(self.config.transport_search_timeout)?;
        self.channel.set_rf_freq(rf_freq)?;
        self.channel.set_period(
            channel_period(self.config.transport_period).unwrap_or(self.config.search_period),
        )?;
        if self.channel.discard(DataKind::Broadcast) {
            trace!("dropped beacon heard before the retune");
        }

        // the client keeps beaconing link until it has moved over
        let deadline = Instant::now() + self.config.beacon_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.next_beacon(remaining)?;
            if *self.machine.state() != (State::Link {}) {
                break;
            }
            debug!("client still in link");
        }
        self.expect_state(State::Authentication {})
    }

    /// Authenticates with a stored passkey, or pairs if `pair` is set and
    /// the device is unknown. Pairing waits up to `timeout` for the user to
    /// confirm on the device.
    ///
    /// A rejected passkey is dropped from the store so the next attempt
    /// pairs again.
    ///
    /// # Errors
    /// [`HostError::UnexpectedState`] unless the device ends up in transport.
    pub fn auth(&mut self, pair: bool, timeout: Duration) -> Result<(), HostError> {
        self.expect_state(State::Authentication {})?;
        let beacon_timeout = self.config.beacon_timeout;
        self.send(&Command::Auth {
            op: AuthOp::ClientSerial,
            host_id: self.config.host_id,
            auth: Vec::new(),
        })?;
        let (_, client_id, serial) = self.auth_response(beacon_timeout)?;
        debug!(
            "client {client_id:#010x} is {}",
            String::from_utf8_lossy(&serial)
        );

        if let Some(key) = self.db.get_key(client_id).map(<[u8]>::to_vec) {
            self.send(&Command::Auth {
                op: AuthOp::Passkey,
                host_id: self.config.host_id,
                auth: key,
            })?;
            let (response, _, _) = self.auth_response(beacon_timeout)?;
            if response != AuthResponse::Accept {
                warn!("device {client_id:#010x} rejected its passkey, it has to pair again");
                self.db.delete_device(client_id).map_err(HostError::Store)?;
            } else if let Some(device) = &self.device {
                self.db
                    .add_device_id(device.device_number, client_id)
                    .map_err(HostError::Store)?;
            }
        } else if pair {
            self.send(&Command::Auth {
                op: AuthOp::Pair,
                host_id: self.config.host_id,
                auth: self.config.host_name.as_bytes().to_vec(),
            })?;
            let (response, _, key) = self.auth_response(timeout)?;
            if response == AuthResponse::Accept {
                debug!("paired with {client_id:#010x}");
                self.db.add_key(client_id, &key).map_err(HostError::Store)?;
                if let Some(device) = &self.device {
                    self.db
                        .add_device_id(device.device_number, client_id)
                        .map_err(HostError::Store)?;
                }
            } else {
                warn!("device {client_id:#010x} declined pairing");
            }
        } else {
            warn!("device {client_id:#010x} is not paired and pairing is disabled");
        }

        if *self.machine.state() != (State::Transport {}) {
            self.next_beacon(beacon_timeout)?;
        }
        self.expect_state(State::Transport {})
    }

    /// Sends an application payload.
    ///
    /// # Errors
    /// Fails if the transfer fails.
    pub fn write(&mut self, data: &[u8]) -> Result<(), HostError> {
        self.send(&Command::Direct {
            fd: self.config.direct_file_descriptor,
            offset: 0,
            data: data.to_vec(),
        })
    }

    /// Receives the next application payload.
    ///
    /// # Errors
    /// Fails if nothing arrives in time or the client sends another command.
    pub fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, HostError> {
        match self.transfer(timeout)? {
            Command::Direct { data, .. } => Ok(data),
            other => Err(HostError::UnexpectedResponse(other)),
        }
    }

    /// # Errors
    /// Fails if the ping cannot be delivered.
    pub fn ping(&mut self) -> Result<(), HostError> {
        self.send(&Command::Ping)
    }

    /// Tells the client to go back to search and closes the channel. Only
    /// closing the channel can fail.
    ///
    /// # Errors
    /// Fails if the channel does not close.
    pub fn disconnect(&mut self) -> Result<(), HostError> {
        if let Err(e) = self.channel.recv_broadcast(DISCONNECT_LISTEN) {
            trace!("no beacon before disconnect: {e}");
        }
        if let Err(e) = self
            .channel
            .send_acknowledged(&Command::Disconnect.to_bytes(), true)
        {
            debug!("sending disconnect: {e}");
        }
        self.handle(&HostEvent::Disconnect);
        self.device = None;
        Ok(self.channel.close()?)
    }
}

#[cfg(test)]
mod tests {
    use std::{mem, sync::Arc};

    use ant_core::{EventCode, Message, message::id};

    use super::*;
    use crate::{
        Session,
        transport::mock::{self, MockTransport, broadcast, burst, device, event},
    };

    const CLIENT_ID: u32 = 0x3C8F_0001;
    const KEY: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

    fn beacon(state: DeviceState) -> Beacon {
        Beacon {
            period: 4,
            data_available: true,
            upload_enabled: false,
            pairing_enabled: true,
            state,
            auth_type: 3,
            descriptor: 0,
            data: Vec::new(),
        }
    }

    fn transfer(channel: u8, state: DeviceState, command: &Command) -> Vec<Message> {
        let mut bytes = beacon(state).to_bytes();
        bytes.extend(command.to_bytes());
        burst(channel, &bytes)
    }

    /// An ANT-FS client beaconing in link state on every open. A link
    /// command is acknowledged only after one more link beacon, and the
    /// client then beacons link once more on the new frequency before
    /// moving to `after_link`.
    fn client(
        after_link: DeviceState,
        accept_passkey: bool,
    ) -> impl FnMut(&Message) -> Vec<Message> + Send + 'static {
        let mut pending = Vec::new();
        let mut retuning = 0;
        move |msg| {
            let (channel, frame) = match msg {
                Message::OpenChannel(open) => {
                    return vec![
                        mock::response(msg, EventCode::RESPONSE_NO_ERROR),
                        broadcast(open.channel_number, &beacon(DeviceState::Link).to_bytes()),
                    ];
                }
                Message::RequestMessage(request)
                    if request.msg_id == id::CHANNEL_STATUS && retuning > 0 =>
                {
                    retuning -= 1;
                    let state = if retuning > 0 {
                        DeviceState::Link
                    } else {
                        after_link
                    };
                    let mut replies = device(msg);
                    replies.push(broadcast(request.channel_number, &beacon(state).to_bytes()));
                    return replies;
                }
                Message::AcknowledgedData(data) => (data.channel(), data.data.to_vec()),
                Message::BurstTransferData(data) => {
                    if data.sequence() == 0 {
                        pending.clear();
                    }
                    pending.extend(data.data);
                    if !data.is_last() {
                        return Vec::new();
                    }
                    (data.channel(), mem::take(&mut pending))
                }
                _ => return device(msg),
            };
            let mut replies = vec![event(channel, EventCode::EVENT_TRANSFER_TX_COMPLETED)];
            match Command::parse(&frame) {
                Ok(Command::Link { .. }) => {
                    replies.insert(0, broadcast(channel, &beacon(DeviceState::Link).to_bytes()));
                    retuning = 2;
                }
                Ok(Command::Auth {
                    op: AuthOp::ClientSerial,
                    ..
                }) => replies.extend(transfer(
                    channel,
                    DeviceState::Authentication,
                    &Command::AuthResponse {
                        response: AuthResponse::NotApplicable,
                        client_id: CLIENT_ID,
                        auth: b"FR245".to_vec(),
                    },
                )),
                Ok(Command::Auth {
                    op: AuthOp::Pair, ..
                }) => replies.extend(transfer(
                    channel,
                    DeviceState::Transport,
                    &Command::AuthResponse {
                        response: AuthResponse::Accept,
                        client_id: CLIENT_ID,
                        auth: KEY.to_vec(),
                    },
                )),
                Ok(Command::Auth {
                    op: AuthOp::Passkey,
                    auth,
                    ..
                }) => {
                    let (state, response) = if accept_passkey && auth == KEY {
                        (DeviceState::Transport, AuthResponse::Accept)
                    } else {
                        (DeviceState::Link, AuthResponse::Reject)
                    };
                    replies.extend(transfer(
                        channel,
                        state,
                        &Command::AuthResponse {
                            response,
                            client_id: CLIENT_ID,
                            auth: Vec::new(),
                        },
                    ));
                    replies.push(broadcast(channel, &beacon(state).to_bytes()));
                }
                Ok(Command::Direct { fd, data, .. }) => replies.extend(transfer(
                    channel,
                    DeviceState::Transport,
                    &Command::Direct {
                        fd,
                        offset: 0,
                        data,
                    },
                )),
                _ => {}
            }
            replies
        }
    }

    fn config() -> HostConfig {
        HostConfig {
            beacon_timeout: Duration::from_millis(500),
            ..HostConfig::default()
        }
    }

    fn host(session: &Session, db: KnownDeviceDb) -> Host {
        Host::new(
            session.channels()[0].clone(),
            session.networks()[0].clone(),
            db,
            config(),
        )
    }

    fn setup(after_link: DeviceState, accept_passkey: bool) -> (Session, Arc<MockTransport>) {
        mock::session(client(after_link, accept_passkey))
    }

    #[test]
    fn pair_and_exchange_data() {
        let (session, transport) = setup(DeviceState::Authentication, true);
        let mut host = host(&session, KnownDeviceDb::in_memory());

        let found = host
            .search(Duration::from_secs(2), None, true, false)
            .unwrap()
            .unwrap();
        assert_eq!(found.device_number, 0x1234);
        assert_eq!(found.device_id, None);
        assert_eq!(*host.state(), State::Link {});

        host.link().unwrap();
        assert_eq!(*host.state(), State::Authentication {});
        host.auth(true, Duration::from_secs(1)).unwrap();
        assert_eq!(*host.state(), State::Transport {});
        assert_eq!(host.db().get_key(CLIENT_ID), Some(&KEY[..]));
        assert_eq!(host.db().get_device_id(0x1234), Some(CLIENT_ID));

        let payload = b"hello, ant-fs!!!";
        host.write(payload).unwrap();
        assert_eq!(host.read(Duration::from_secs(1)).unwrap(), payload);
        host.ping().unwrap();

        host.disconnect().unwrap();
        assert_eq!(*host.state(), State::Disconnected {});
        assert!(transport.count(|m| matches!(m, Message::AcknowledgedData(_))) >= 3);
    }

    #[test]
    fn link_outlasts_beacons_from_before_the_move() {
        let (session, transport) = setup(DeviceState::Authentication, true);
        let mut host = host(&session, KnownDeviceDb::in_memory());
        host.search(Duration::from_secs(2), None, true, false)
            .unwrap()
            .unwrap();
        host.link().unwrap();
        assert_eq!(*host.state(), State::Authentication {});

        // the stale beacon was dropped without a read, the next link beacon
        // was read and skipped, then authentication arrived
        let written = transport.written();
        let retuned = written
            .iter()
            .rposition(|m| matches!(m, Message::SetChannelPeriod(_)))
            .unwrap();
        let status_requests = written[retuned..]
            .iter()
            .filter(|m| matches!(m, Message::RequestMessage(r) if r.msg_id == id::CHANNEL_STATUS))
            .count();
        assert_eq!(status_requests, 2);
    }

    #[test]
    fn transport_beacon_straight_after_link_fails() {
        let (session, _transport) = setup(DeviceState::Transport, true);
        let mut host = host(&session, KnownDeviceDb::in_memory());
        host.search(Duration::from_secs(2), None, true, false)
            .unwrap()
            .unwrap();
        assert!(matches!(
            host.link(),
            Err(HostError::UnexpectedState {
                expected: State::Authentication {},
                actual: State::Error {},
            })
        ));
    }

    #[test]
    fn unpaired_devices_are_skipped() {
        let (session, transport) = setup(DeviceState::Authentication, true);
        let mut host = host(&session, KnownDeviceDb::in_memory());
        let found = host
            .search(Duration::from_millis(300), None, false, false)
            .unwrap();
        assert_eq!(found, None);
        assert!(transport.count(|m| matches!(m, Message::OpenChannel(_))) >= 2);
    }

    #[test]
    fn known_device_authenticates_with_passkey() {
        let (session, _transport) = setup(DeviceState::Authentication, true);
        let mut db = KnownDeviceDb::in_memory();
        db.add_key(CLIENT_ID, &KEY).unwrap();
        db.add_device_id(0x1234, CLIENT_ID).unwrap();
        let mut host = host(&session, db);

        let found = host
            .search(Duration::from_secs(2), Some(CLIENT_ID), false, false)
            .unwrap()
            .unwrap();
        assert_eq!(found.device_id, Some(CLIENT_ID));
        host.link().unwrap();
        host.auth(false, Duration::from_secs(1)).unwrap();
        assert_eq!(*host.state(), State::Transport {});
    }

    #[test]
    fn rejected_passkey_is_forgotten() {
        let (session, _transport) = setup(DeviceState::Authentication, false);
        let mut db = KnownDeviceDb::in_memory();
        db.add_key(CLIENT_ID, &KEY).unwrap();
        db.add_device_id(0x1234, CLIENT_ID).unwrap();
        let mut host = host(&session, db);

        host.search(Duration::from_secs(2), None, false, false)
            .unwrap()
            .unwrap();
        host.link().unwrap();
        assert!(matches!(
            host.auth(false, Duration::from_secs(1)),
            Err(HostError::UnexpectedState {
                expected: State::Transport {},
                actual: State::Link {},
            })
        ));
        assert_eq!(host.db().get_key(CLIENT_ID), None);
    }

    #[test]
    fn auth_requires_a_link() {
        let (session, _transport) = setup(DeviceState::Authentication, true);
        let mut host = host(&session, KnownDeviceDb::in_memory());
        assert!(matches!(
            host.auth(true, Duration::from_secs(1)),
            Err(HostError::UnexpectedState {
                expected: State::Authentication {},
                actual: State::Disconnected {},
            })
        ));
    }
}
