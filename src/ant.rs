//! ANT serial protocol and the Stride & Distance broadcast channel.
//!
//! Frames on the wire are `[0xA4, len, id, payload.., checksum]` where the
//! checksum is the XOR of every preceding byte. [`AntCodec`] handles framing
//! and resynchronises on corrupt input; [`AntLink`] configures the channel
//! and answers every transmit event with the next datapage.

use crate::{
    datapage::{AntBroadcastState, AntInputs, StrideDistanceEncoder},
    error::{BridgeError, Result},
    types::AntConfig,
};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{
    codec::{Decoder, Encoder, Framed},
    sync::CancellationToken,
};
use tracing::{debug, error, info, trace, warn};

/// Frame start byte
pub const SYNC: u8 = 0xA4;

/// Longest payload accepted before the length byte is treated as noise
pub const MAX_PAYLOAD: usize = 64;

/// Channel response or RF event
pub const MSG_CHANNEL_EVENT: u8 = 0x40;
/// Unassign channel
pub const MSG_UNASSIGN_CHANNEL: u8 = 0x41;
/// Assign channel
pub const MSG_ASSIGN_CHANNEL: u8 = 0x42;
/// Channel period
pub const MSG_CHANNEL_PERIOD: u8 = 0x43;
/// Channel RF frequency
pub const MSG_RF_FREQUENCY: u8 = 0x45;
/// Set network key
pub const MSG_NETWORK_KEY: u8 = 0x46;
/// Reset system
pub const MSG_RESET_SYSTEM: u8 = 0x4A;
/// Open channel
pub const MSG_OPEN_CHANNEL: u8 = 0x4B;
/// Close channel
pub const MSG_CLOSE_CHANNEL: u8 = 0x4C;
/// Broadcast data
pub const MSG_BROADCAST_DATA: u8 = 0x4E;
/// Channel id
pub const MSG_CHANNEL_ID: u8 = 0x51;
/// Startup message sent by the stick after a reset
pub const MSG_STARTUP: u8 = 0x6F;

/// Message id carried by RF events inside [`MSG_CHANNEL_EVENT`]
pub const RF_EVENT: u8 = 0x01;
/// Response code: no error
pub const RESPONSE_NO_ERROR: u8 = 0x00;
/// A broadcast slot went out; the stick wants the next payload
pub const EVENT_TX: u8 = 0x03;
/// The channel was closed by the stick
pub const EVENT_CHANNEL_CLOSED: u8 = 0x07;
/// Serial queue overflow
pub const EVENT_SERIAL_QUE_OVERFLOW: u8 = 0x34;
/// Transmit queue overflow
pub const EVENT_QUE_OVERFLOW: u8 = 0x35;

/// Bidirectional master (transmit) channel type
pub const CHANNEL_TYPE_MASTER: u8 = 0x10;

/// One ANT serial message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntMessage {
    /// Message id
    pub id: u8,
    /// Message payload
    pub payload: Bytes,
}

/// Decoded [`MSG_CHANNEL_EVENT`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEvent {
    /// Channel (or network) the event refers to
    pub channel: u8,
    /// [`RF_EVENT`] or the id of the command being answered
    pub message_id: u8,
    /// Event or response code
    pub code: u8,
}

impl ChannelEvent {
    /// Whether this is an RF event rather than a command response
    #[must_use]
    pub const fn is_rf_event(&self) -> bool {
        self.message_id == RF_EVENT
    }
}

impl AntMessage {
    /// Build a message from an id and payload bytes
    #[must_use]
    pub fn new(id: u8, payload: &[u8]) -> Self {
        Self {
            id,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Reset the stick
    #[must_use]
    pub fn reset_system() -> Self {
        Self::new(MSG_RESET_SYSTEM, &[0x00])
    }

    /// Load a network key
    #[must_use]
    pub fn set_network_key(network: u8, key: &[u8; 8]) -> Self {
        let mut payload = Vec::with_capacity(9);
        payload.push(network);
        payload.extend_from_slice(key);
        Self::new(MSG_NETWORK_KEY, &payload)
    }

    /// Assign a channel to a network
    #[must_use]
    pub fn assign_channel(channel: u8, channel_type: u8, network: u8) -> Self {
        Self::new(MSG_ASSIGN_CHANNEL, &[channel, channel_type, network])
    }

    /// Set the channel id
    #[must_use]
    pub fn channel_id(channel: u8, device_number: u16, device_type: u8, transmission_type: u8) -> Self {
        let [lo, hi] = device_number.to_le_bytes();
        Self::new(MSG_CHANNEL_ID, &[channel, lo, hi, device_type, transmission_type])
    }

    /// Set the channel period (1/32768 s)
    #[must_use]
    pub fn channel_period(channel: u8, period: u16) -> Self {
        let [lo, hi] = period.to_le_bytes();
        Self::new(MSG_CHANNEL_PERIOD, &[channel, lo, hi])
    }

    /// Set the RF frequency (offset from 2400 MHz)
    #[must_use]
    pub fn rf_frequency(channel: u8, frequency: u8) -> Self {
        Self::new(MSG_RF_FREQUENCY, &[channel, frequency])
    }

    /// Open a channel
    #[must_use]
    pub fn open_channel(channel: u8) -> Self {
        Self::new(MSG_OPEN_CHANNEL, &[channel])
    }

    /// Close a channel
    #[must_use]
    pub fn close_channel(channel: u8) -> Self {
        Self::new(MSG_CLOSE_CHANNEL, &[channel])
    }

    /// Unassign a channel
    #[must_use]
    pub fn unassign_channel(channel: u8) -> Self {
        Self::new(MSG_UNASSIGN_CHANNEL, &[channel])
    }

    /// Queue an 8-byte broadcast payload
    #[must_use]
    pub fn broadcast_data(channel: u8, data: &[u8; 8]) -> Self {
        let mut payload = Vec::with_capacity(9);
        payload.push(channel);
        payload.extend_from_slice(data);
        Self::new(MSG_BROADCAST_DATA, &payload)
    }

    /// Channel response or event carried by this message
    #[must_use]
    pub fn channel_event(&self) -> Option<ChannelEvent> {
        if self.id != MSG_CHANNEL_EVENT || self.payload.len() < 3 {
            return None;
        }
        Some(ChannelEvent {
            channel: self.payload[0],
            message_id: self.payload[1],
            code: self.payload[2],
        })
    }
}

/// XOR of all bytes
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// ANT serial framing
#[derive(Debug, Default, Clone, Copy)]
pub struct AntCodec;

impl Decoder for AntCodec {
    type Item = AntMessage;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AntMessage>> {
        loop {
            match src.iter().position(|b| *b == SYNC) {
                Some(0) => {}
                Some(skip) => {
                    trace!("Discarding {skip} bytes before ANT sync");
                    src.advance(skip);
                }
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            if src.len() < 2 {
                return Ok(None);
            }
            let len = src[1] as usize;
            if len > MAX_PAYLOAD {
                src.advance(1);
                continue;
            }

            let frame_len = len + 4;
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            let expected = checksum(&src[..frame_len - 1]);
            if expected != src[frame_len - 1] {
                warn!(
                    "ANT frame checksum mismatch: expected {expected:02X}, got {:02X}",
                    src[frame_len - 1]
                );
                src.advance(1);
                continue;
            }

            let mut frame = src.split_to(frame_len);
            frame.advance(2);
            let id = frame.get_u8();
            let payload = frame.split_to(len).freeze();
            return Ok(Some(AntMessage { id, payload }));
        }
    }
}

impl Encoder<AntMessage> for AntCodec {
    type Error = BridgeError;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: AntMessage, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > MAX_PAYLOAD {
            return Err(BridgeError::InvalidParameters(format!(
                "ANT payload of {} bytes",
                item.payload.len()
            )));
        }
        let start = dst.len();
        dst.reserve(item.payload.len() + 4);
        dst.put_u8(SYNC);
        dst.put_u8(item.payload.len() as u8);
        dst.put_u8(item.id);
        dst.extend_from_slice(&item.payload);
        let sum = checksum(&dst[start..]);
        dst.put_u8(sum);
        Ok(())
    }
}

/// Byte stream to an ANT stick
pub trait AntIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AntIo for T {}

/// Something that can hand out a fresh connection to an ANT stick
#[async_trait]
pub trait AntPort: Send + Sync {
    /// Open the stick
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    async fn open(&self) -> Result<Box<dyn AntIo>>;
}

/// ANT USB stick exposed as a tty device (for example `/dev/ttyUSB0`)
///
/// The line speed is left as configured by the kernel driver.
#[derive(Debug, Clone)]
pub struct SerialAntPort {
    path: PathBuf,
}

impl SerialAntPort {
    /// Use the device node at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AntPort for SerialAntPort {
    async fn open(&self) -> Result<Box<dyn AntIo>> {
        info!("Opening ANT stick at {}", self.path.display());
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        Ok(Box::new(file))
    }
}

/// Events published by the ANT+ link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AntEvent {
    /// Channel configured and broadcasting
    ChannelOpened,
    /// Transmit queue overflowed; the channel is being restarted
    TransmitOverflow,
    /// Channel went down
    ChannelClosed,
    /// Free-text status line
    Diagnostic(String),
}

type AntFramed = Framed<Box<dyn AntIo>, AntCodec>;

/// ANT+ Stride & Distance broadcaster
///
/// A supervisor task owns the datapage encoder for the lifetime of the link
/// and reopens the channel after any failure, so accumulators are never
/// reset by a restart.
pub struct AntLink {
    events: broadcast::Sender<AntEvent>,
    state: watch::Receiver<AntBroadcastState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AntLink {
    /// Configure the stick behind `port` and start broadcasting `inputs`
    #[must_use]
    pub fn start(
        port: Arc<dyn AntPort>,
        config: AntConfig,
        inputs: watch::Receiver<AntInputs>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (state_tx, state) = watch::channel(AntBroadcastState::default());
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            port,
            encoder: StrideDistanceEncoder::new(&config),
            config,
            inputs,
            events: events.clone(),
            state: state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            events,
            state,
            cancel,
            task: Some(task),
        }
    }

    /// Subscribe to link events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AntEvent> {
        self.events.subscribe()
    }

    /// Accumulators after the most recent page
    #[must_use]
    pub fn broadcast_state(&self) -> AntBroadcastState {
        *self.state.borrow()
    }

    /// Close the channel and wait for the link task to finish
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("ANT+ task ended abnormally: {e}");
            }
            info!("ANT+ link stopped");
        }
    }
}

impl Drop for AntLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    port: Arc<dyn AntPort>,
    config: AntConfig,
    encoder: StrideDistanceEncoder,
    inputs: watch::Receiver<AntInputs>,
    events: broadcast::Sender<AntEvent>,
    state: watch::Sender<AntBroadcastState>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let restart_delay = Duration::from_millis(self.config.restart_delay_ms);
        while !self.cancel.is_cancelled() {
            match self.run_channel().await {
                Ok(()) => break,
                Err(e) => {
                    if matches!(e, BridgeError::TransmitOverflow) {
                        warn!("ANT+ transmit overflow, restarting channel");
                        let _ = self.events.send(AntEvent::TransmitOverflow);
                    } else {
                        warn!("ANT+ channel failed: {e}");
                        let _ = self.events.send(AntEvent::Diagnostic(format!(
                            "ANT+ channel failed: {e}"
                        )));
                    }
                    let _ = self.events.send(AntEvent::ChannelClosed);
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(restart_delay) => {
                    info!("Reopening ANT+ channel");
                }
            }
        }
        debug!("ANT+ supervisor exiting");
    }

    /// Run one channel lifetime; `Ok` only when cancelled
    async fn run_channel(&mut self) -> Result<()> {
        let io = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            io = self.port.open() => io?,
        };
        let mut framed = Framed::new(io, AntCodec);

        tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = configure(&mut framed, &self.config) => result?,
        }

        info!(
            "ANT+ Stride & Distance channel open as device {}",
            self.config.device_number
        );
        let _ = self.events.send(AntEvent::ChannelOpened);

        self.encoder.update(&self.inputs.borrow_and_update());
        let mut inputs_open = true;
        let mut last_tick = Instant::now();
        let channel = self.config.channel;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Closing ANT+ channel");
                    let timeout = Duration::from_millis(self.config.command_timeout_ms);
                    let close = framed.send(AntMessage::close_channel(channel));
                    let _ = tokio::time::timeout(timeout, close).await;
                    return Ok(());
                }
                changed = self.inputs.changed(), if inputs_open => {
                    if changed.is_ok() {
                        self.encoder.update(&self.inputs.borrow_and_update());
                    } else {
                        debug!("ANT+ input source closed, holding last values");
                        inputs_open = false;
                    }
                }
                frame = framed.next() => {
                    let message = match frame {
                        Some(message) => message?,
                        None => return Err(BridgeError::Ant("stick closed the connection".to_string())),
                    };
                    let Some(event) = message.channel_event() else {
                        trace!("Ignoring ANT message {:02X}", message.id);
                        continue;
                    };
                    if !event.is_rf_event() {
                        continue;
                    }
                    match event.code {
                        EVENT_TX => {
                            let now = Instant::now();
                            let page = self.encoder.next_page(now - last_tick);
                            last_tick = now;
                            self.state.send_replace(self.encoder.state());
                            framed.send(AntMessage::broadcast_data(channel, page.as_bytes())).await?;
                        }
                        EVENT_SERIAL_QUE_OVERFLOW | EVENT_QUE_OVERFLOW => {
                            return Err(BridgeError::TransmitOverflow);
                        }
                        EVENT_CHANNEL_CLOSED => {
                            return Err(BridgeError::Ant("channel closed by stick".to_string()));
                        }
                        code => trace!("Ignoring ANT RF event {code:02X}"),
                    }
                }
            }
        }
    }
}

/// Reset the stick and bring up the master channel
async fn configure(framed: &mut AntFramed, config: &AntConfig) -> Result<()> {
    let timeout = Duration::from_millis(config.command_timeout_ms);

    framed.send(AntMessage::reset_system()).await?;
    let startup = tokio::time::timeout(timeout, async {
        while let Some(message) = framed.next().await {
            if message?.id == MSG_STARTUP {
                return Ok::<(), BridgeError>(());
            }
        }
        Err(BridgeError::Ant("stick closed during reset".to_string()))
    })
    .await;
    match startup {
        Ok(result) => result?,
        Err(_) => warn!("ANT stick sent no startup message, continuing"),
    }

    let channel = config.channel;
    let commands = [
        AntMessage::set_network_key(config.network, &config.network_key),
        AntMessage::assign_channel(channel, CHANNEL_TYPE_MASTER, config.network),
        AntMessage::channel_id(
            channel,
            config.device_number,
            config.device_type,
            config.transmission_type,
        ),
        AntMessage::channel_period(channel, config.channel_period),
        AntMessage::rf_frequency(channel, config.rf_frequency),
        AntMessage::open_channel(channel),
    ];

    for command in commands {
        let id = command.id;
        debug!("ANT command {id:02X} {:02X?}", command.payload.as_ref());
        framed.send(command).await?;
        tokio::time::timeout(timeout, await_response(framed, id))
            .await
            .map_err(|_| BridgeError::AntTimeout {
                message_id: id,
                timeout_ms: config.command_timeout_ms,
            })??;
    }
    Ok(())
}

async fn await_response(framed: &mut AntFramed, id: u8) -> Result<()> {
    while let Some(message) = framed.next().await {
        let Some(event) = message?.channel_event() else {
            continue;
        };
        if event.message_id != id {
            continue;
        }
        if event.code == RESPONSE_NO_ERROR {
            return Ok(());
        }
        return Err(BridgeError::Ant(format!(
            "command {id:02X} rejected with code {:02X}",
            event.code
        )));
    }
    Err(BridgeError::Ant("stick closed during configuration".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: AntMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        AntCodec.encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_layout() {
        let buf = encode(AntMessage::open_channel(0));
        assert_eq!(buf.as_ref(), &[0xA4, 0x01, 0x4B, 0x00, 0xA4 ^ 0x01 ^ 0x4B]);
    }

    #[test]
    fn test_configuration_payloads() {
        let config = AntConfig::default();
        assert_eq!(
            AntMessage::set_network_key(0, &config.network_key).payload.as_ref(),
            &[0x00, 0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45]
        );
        assert_eq!(
            AntMessage::channel_id(0, 12_345, 124, 5).payload.as_ref(),
            &[0x00, 0x39, 0x30, 124, 5]
        );
        assert_eq!(
            AntMessage::channel_period(0, 8_134).payload.as_ref(),
            &[0x00, 0xC6, 0x1F]
        );
        assert_eq!(
            AntMessage::assign_channel(0, CHANNEL_TYPE_MASTER, 0).payload.as_ref(),
            &[0x00, 0x10, 0x00]
        );
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let frame = encode(AntMessage::broadcast_data(0, &[1, 2, 3, 4, 5, 6, 7, 8]));
        let mut codec = AntCodec;

        let mut buf = BytesMut::from(&frame[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.id, MSG_BROADCAST_DATA);
        assert_eq!(message.payload.as_ref(), &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_resyncs_after_garbage() {
        let mut buf = BytesMut::from(&[0x00, 0xFF, 0x12][..]);
        // corrupt frame: wrong checksum
        buf.extend_from_slice(&[0xA4, 0x01, 0x4B, 0x00, 0x00]);
        buf.extend_from_slice(&encode(AntMessage::new(MSG_CHANNEL_EVENT, &[0x00, RF_EVENT, EVENT_TX])));

        let message = AntCodec.decode(&mut buf).unwrap().unwrap();
        let event = message.channel_event().unwrap();
        assert!(event.is_rf_event());
        assert_eq!(event.code, EVENT_TX);
    }

    #[test]
    fn test_channel_event_parsing() {
        let response = AntMessage::new(MSG_CHANNEL_EVENT, &[0x00, MSG_OPEN_CHANNEL, 0x00]);
        let event = response.channel_event().unwrap();
        assert!(!event.is_rf_event());
        assert_eq!(event.message_id, MSG_OPEN_CHANNEL);

        assert!(AntMessage::open_channel(0).channel_event().is_none());
        assert!(AntMessage::new(MSG_CHANNEL_EVENT, &[0x00]).channel_event().is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        let result = AntCodec.encode(AntMessage::new(MSG_BROADCAST_DATA, &[0; 80]), &mut buf);
        assert!(result.is_err());
    }

    use crate::mock::MockAntStick;

    fn link_config() -> AntConfig {
        AntConfig {
            command_timeout_ms: 500,
            restart_delay_ms: 20,
            ..AntConfig::default()
        }
    }

    async fn wait_for(rx: &mut broadcast::Receiver<AntEvent>, wanted: &AntEvent) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.unwrap() != *wanted {}
        })
        .await
        .expect("ANT+ event not received");
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_link_configures_then_broadcasts() {
        let stick = MockAntStick::new(Duration::from_millis(5));
        let (_inputs, inputs_rx) = watch::channel(AntInputs::default());
        let mut link = AntLink::start(Arc::new(stick.clone()), link_config(), inputs_rx);
        let mut rx = link.subscribe();

        wait_for(&mut rx, &AntEvent::ChannelOpened).await;
        assert_eq!(
            stick.commands(),
            vec![
                MSG_RESET_SYSTEM,
                MSG_NETWORK_KEY,
                MSG_ASSIGN_CHANNEL,
                MSG_CHANNEL_ID,
                MSG_CHANNEL_PERIOD,
                MSG_RF_FREQUENCY,
                MSG_OPEN_CHANNEL,
            ]
        );

        wait_until(|| stick.broadcasts().len() >= 4).await;
        let pages = stick.broadcasts();
        assert_eq!(pages[0][0], 80);
        assert_eq!(pages[3][0], 1);

        link.stop().await;
        wait_until(|| stick.commands().last() == Some(&MSG_CLOSE_CHANNEL)).await;
    }

    #[tokio::test]
    async fn test_overflow_restart_preserves_accumulators() {
        let stick = MockAntStick::new(Duration::from_millis(5));
        let (inputs, inputs_rx) = watch::channel(AntInputs {
            speed_mps: 2.5,
            distance_m: Some(0.0),
            calories: None,
            session: 1,
        });
        let mut link = AntLink::start(Arc::new(stick.clone()), link_config(), inputs_rx);
        let mut rx = link.subscribe();
        wait_for(&mut rx, &AntEvent::ChannelOpened).await;

        inputs.send_modify(|i| i.distance_m = Some(50.0));
        wait_until(|| link.broadcast_state().distance_accumulator >= 50.0).await;

        stick.inject_overflow();
        wait_for(&mut rx, &AntEvent::TransmitOverflow).await;
        wait_for(&mut rx, &AntEvent::ChannelOpened).await;
        assert_eq!(stick.open_count(), 2);

        inputs.send_modify(|i| i.distance_m = Some(70.0));
        wait_until(|| link.broadcast_state().distance_accumulator >= 70.0).await;
        assert!((link.broadcast_state().distance_accumulator - 70.0).abs() < f64::EPSILON);

        link.stop().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_retried() {
        let stick = MockAntStick::new(Duration::from_millis(5));
        stick.set_fail_open(true);
        let (_inputs, inputs_rx) = watch::channel(AntInputs::default());
        let mut link = AntLink::start(Arc::new(stick.clone()), link_config(), inputs_rx);
        let mut rx = link.subscribe();

        wait_for(&mut rx, &AntEvent::ChannelClosed).await;
        stick.set_fail_open(false);
        wait_for(&mut rx, &AntEvent::ChannelOpened).await;
        assert_eq!(stick.open_count(), 1);

        link.stop().await;
    }
}
