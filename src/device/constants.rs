use uuid::Uuid;

/**
 * The instrument sends one pressure sample every PROTOCOL_TICK milliseconds.
 */
pub const PROTOCOL_TICK: i64 = 20;

/**
 * How often (milliseconds) to attempt to reconnect while the connection has failed.
 */
pub const RETRY_INTERVAL: u64 = 15000;

/**
 * How long (milliseconds) a single connect attempt (per connection mode) may take.
 */
pub const CONNECT_DEADLINE: u64 = 10000;

/**
 * Size of the buffer used when reading lines from the instrument.
 */
pub const READ_BUFFER_SIZE: usize = 256;

/**
 * How many messages may queue up for a single client before deliveries to it fail.
 */
pub const SUBSCRIBER_BUFFER: usize = 64;

/**
 * Longest line (bytes) accepted from the instrument. Longer lines are garbage and dropped.
 */
pub const MAX_LINE_LENGTH: usize = 128;

/**
 * Serial Port Profile service class, 00001101-0000-1000-8000-00805F9B34FB.
 */
pub const SERIAL_PORT_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5f9b_34fb);

/**
 * RFCOMM channel used when the serial port profile can not be connected.
 */
pub const FALLBACK_RFCOMM_CHANNEL: u8 = 1;

pub const PREFIX_PRESSURE: &str = "PRS";
pub const PREFIX_BATTERY: &str = "BAT";
// Other prefixes sent by the instrument: BFV, TMP, BST, SET
