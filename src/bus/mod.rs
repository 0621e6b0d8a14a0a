//! Field bus collaborator interface
//!
//! The bridge only talks to the ventilation unit through [`ValloxBus`] and a
//! channel of decoded [`RegisterValue`] events. Framing, checksums and serial
//! I/O live behind that seam in [`serial`].
//!
//! ```text
//! SerialBus ──[RegisterValue]──► Dispatcher
//!     ▲                              │
//!     └──── query / write_speed ─────┘
//! ```

pub mod codec;
pub mod serial;

/// Register address on the bus
pub type Register = u8;

/// Well-known register addresses
pub mod registers {
    use super::Register;

    pub const FAN_SPEED: Register = 0x29;

    pub const TEMP_INCOMING_OUTSIDE: Register = 0x32;
    pub const TEMP_OUTGOING_OUTSIDE: Register = 0x33;
    pub const TEMP_OUTGOING_INSIDE: Register = 0x34;
    pub const TEMP_INCOMING_INSIDE: Register = 0x35;

    // Newer firmware reports the temperatures on a different block
    pub const TEMP_INCOMING_OUTSIDE_NEW: Register = 0x58;
    pub const TEMP_OUTGOING_OUTSIDE_NEW: Register = 0x59;
    pub const TEMP_OUTGOING_INSIDE_NEW: Register = 0x5a;
    pub const TEMP_INCOMING_INSIDE_NEW: Register = 0x5b;
}

/// Highest fan speed the unit supports
pub const MAX_SPEED: u8 = 8;

/// A decoded register event as reported by the bus driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterValue {
    pub register: Register,
    /// Unit-scaled value
    pub value: i32,
    /// Byte as transmitted on the bus
    pub raw: u8,
    /// Bus address of the receiver this event was sent to
    pub receiver: u8,
}

impl RegisterValue {
    pub fn new(register: Register, value: i32, raw: u8) -> Self {
        Self {
            register,
            value,
            raw,
            receiver: 0,
        }
    }

    pub fn addressed_to(mut self, receiver: u8) -> Self {
        self.receiver = receiver;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to open serial device {device}: {reason}")]
    OpenError { device: String, reason: String },

    #[error("Bus writes are disabled")]
    WriteDisabled,

    #[error("Fan speed {0} out of range 1-8")]
    InvalidSpeed(u8),

    #[error("Bus writer queue unavailable: {0}")]
    QueueError(String),

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the dispatcher may request from the bus driver.
///
/// Both `query` and `write_speed` only enqueue a frame; they never wait for
/// the unit to answer. The answer, if any, arrives later on the event channel.
pub trait ValloxBus: Send {
    /// Whether an event was addressed to this controller
    fn is_for_me(&self, event: &RegisterValue) -> bool;

    /// Ask the mainboard to report the current value of `register`
    fn query(&self, register: Register) -> Result<(), BusError>;

    /// Request a new fan speed (1-8)
    fn write_speed(&self, speed: u8) -> Result<(), BusError>;
}

/// Fan speed is transmitted as a bitmask with one bit per speed step
pub fn encode_speed(speed: u8) -> Result<u8, BusError> {
    if !(1..=MAX_SPEED).contains(&speed) {
        return Err(BusError::InvalidSpeed(speed));
    }
    Ok(((1u16 << speed) - 1) as u8)
}

pub fn decode_speed(raw: u8) -> i32 {
    raw.count_ones() as i32
}

/// NTC sensor byte to whole degrees Celsius
#[rustfmt::skip]
const TEMPERATURE_TABLE: [i8; 256] = [
    -74, -70, -66, -62, -59, -56, -54, -52, -50, -48, // 0x00
    -47, -46, -44, -43, -42, -41, -40, -39, -38, -37, // 0x0a
    -36, -35, -34, -33, -33, -32, -31, -30, -30, -29, // 0x14
    -28, -28, -27, -27, -26, -25, -25, -24, -24, -23, // 0x1e
    -23, -22, -22, -21, -21, -20, -20, -19, -19, -19, // 0x28
    -18, -18, -17, -17, -16, -16, -16, -15, -15, -14, // 0x32
    -14, -14, -13, -13, -12, -12, -12, -11, -11, -11, // 0x3c
    -10, -10,  -9,  -9,  -9,  -8,  -8,  -8,  -7,  -7, // 0x46
     -7,  -6,  -6,  -6,  -5,  -5,  -5,  -4,  -4,  -4, // 0x50
     -3,  -3,  -3,  -2,  -2,  -2,  -1,  -1,  -1,  -1, // 0x5a
      0,   0,   0,   1,   1,   1,   2,   2,   2,   3, // 0x64
      3,   3,   4,   4,   4,   5,   5,   5,   5,   6, // 0x6e
      6,   6,   7,   7,   7,   8,   8,   8,   9,   9, // 0x78
      9,  10,  10,  10,  11,  11,  11,  12,  12,  12, // 0x82
     13,  13,  13,  14,  14,  14,  15,  15,  15,  16, // 0x8c
     16,  16,  17,  17,  18,  18,  18,  19,  19,  19, // 0x96
     20,  20,  21,  21,  21,  22,  22,  22,  23,  23, // 0xa0
     24,  24,  24,  25,  25,  26,  26,  27,  27,  27, // 0xaa
     28,  28,  29,  29,  30,  30,  31,  31,  32,  32, // 0xb4
     33,  33,  34,  34,  35,  35,  36,  36,  37,  37, // 0xbe
     38,  38,  39,  40,  40,  41,  41,  42,  43,  43, // 0xc8
     44,  45,  45,  46,  47,  48,  48,  49,  50,  51, // 0xd2
     52,  53,  53,  54,  55,  56,  57,  59,  60,  61, // 0xdc
     62,  63,  65,  66,  68,  69,  71,  73,  75,  77, // 0xe6
     79,  81,  82,  86,  90,  93,  97, 100, 100, 100, // 0xf0
    100, 100, 100, 100, 100, 100,                     // 0xfa
];

pub fn decode_temperature(raw: u8) -> i32 {
    TEMPERATURE_TABLE[raw as usize] as i32
}

pub fn is_temperature(register: Register) -> bool {
    matches!(register, 0x32..=0x35 | 0x58..=0x5b)
}

/// Converts a raw register byte into its unit-scaled value.
/// Registers without a known scale keep the raw byte.
pub fn decode_value(register: Register, raw: u8) -> i32 {
    match register {
        registers::FAN_SPEED => decode_speed(raw),
        r if is_temperature(r) => decode_temperature(raw),
        _ => raw as i32,
    }
}
