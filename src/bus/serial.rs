//! RS485 serial adapter for the [`ValloxBus`] seam
//!
//! Opens the serial device and spawns two tasks: a reader that turns frames
//! into [`RegisterValue`] events, and a writer that drains the outbound frame
//! queue. `query` and `write_speed` only push into that queue.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use super::codec::{Frame, FrameCodec, QUERY_REGISTER};
use super::{decode_value, encode_speed, registers, BusError, Register, RegisterValue, ValloxBus};

pub const BAUD_RATE: u32 = 9600;
pub const MAINBOARD: u8 = 0x11;
pub const PANEL_BROADCAST: u8 = 0x20;
pub const DEFAULT_PANEL_ADDRESS: u8 = 0x27;

const QUEUE_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
pub struct SerialBusSettings {
    pub device: String,
    pub enable_write: bool,
    /// Address this bridge uses when it acts as a control panel
    pub panel_address: u8,
}

pub struct SerialBus {
    frame_tx: mpsc::Sender<Frame>,
    settings: SerialBusSettings,
}

impl SerialBus {
    /// Opens the device and starts the reader and writer tasks.
    ///
    /// Returns the bus handle and the receiving end of the event channel.
    /// Must be called from within a tokio runtime.
    pub fn open(
        settings: SerialBusSettings,
        event_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<RegisterValue>), BusError> {
        info!(
            "Opening serial device {} (write enabled: {})",
            settings.device, settings.enable_write
        );

        let port = tokio_serial::new(&settings.device, BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| BusError::OpenError {
                device: settings.device.clone(),
                reason: e.to_string(),
            })?;

        let (reader, writer) = tokio::io::split(port);
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        let (frame_tx, frame_rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(read_frames(FramedRead::new(reader, FrameCodec), event_tx));
        tokio::spawn(write_frames(FramedWrite::new(writer, FrameCodec), frame_rx));

        Ok((Self { frame_tx, settings }, event_rx))
    }

    fn enqueue(&self, frame: Frame) -> Result<(), BusError> {
        self.frame_tx
            .try_send(frame)
            .map_err(|e| BusError::QueueError(e.to_string()))
    }
}

impl ValloxBus for SerialBus {
    fn is_for_me(&self, event: &RegisterValue) -> bool {
        event.receiver == self.settings.panel_address || event.receiver == PANEL_BROADCAST
    }

    fn query(&self, register: Register) -> Result<(), BusError> {
        debug!("Querying register {:#04x}", register);
        self.enqueue(Frame {
            sender: self.settings.panel_address,
            receiver: MAINBOARD,
            register: QUERY_REGISTER,
            value: register,
        })
    }

    fn write_speed(&self, speed: u8) -> Result<(), BusError> {
        if !self.settings.enable_write {
            return Err(BusError::WriteDisabled);
        }
        let value = encode_speed(speed)?;
        debug!("Writing fan speed {} ({:#04x})", speed, value);
        self.enqueue(Frame {
            sender: self.settings.panel_address,
            receiver: MAINBOARD,
            register: registers::FAN_SPEED,
            value,
        })
    }
}

async fn read_frames<R>(mut frames: FramedRead<R, FrameCodec>, events: mpsc::Sender<RegisterValue>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) if frame.is_query() => {
                debug!(
                    "Ignoring query from {:#04x} for register {:#04x}",
                    frame.sender, frame.value
                );
            }
            Ok(frame) => {
                let event = RegisterValue::new(
                    frame.register,
                    decode_value(frame.register, frame.value),
                    frame.value,
                )
                .addressed_to(frame.receiver);

                if events.send(event).await.is_err() {
                    warn!("Event receiver dropped, stopping serial reader");
                    return;
                }
            }
            Err(e) => error!("Serial read error: {}", e),
        }
    }
    warn!("Serial stream closed");
}

async fn write_frames<W>(mut sink: FramedWrite<W, FrameCodec>, mut frames: mpsc::Receiver<Frame>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send(frame).await {
            error!("Failed to write frame {:?}: {}", frame, e);
        }
    }
    debug!("Frame queue closed, stopping serial writer");
}
