use super::{AmqpChannelId, AmqpReplyCode};

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_CONTENT_HEADER: u8 = 2;
pub const FRAME_CONTENT_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

pub const FRAME_END: u8 = 206;

/// type (1) + channel (2) + payload size (4)
pub const FRAME_HEADER_SIZE: usize = 7;
/// header plus the trailing frame-end octet
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;
/// Smallest frame_max a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

pub const DEFAULT_CONN_CHANNEL: AmqpChannelId = 0;

pub const REPLY_SUCCESS: AmqpReplyCode = 200;

// soft error / channel
pub const CONTENT_TOO_LARGE: AmqpReplyCode = 311;
pub const NO_ROUTE: AmqpReplyCode = 312;
pub const NO_CONSUMERS: AmqpReplyCode = 313;
pub const ACCESS_REFUSED: AmqpReplyCode = 403;
pub const NOT_FOUND: AmqpReplyCode = 404;
pub const RESOURCE_LOCKED: AmqpReplyCode = 405;
pub const PRECONDITION_FAILED: AmqpReplyCode = 406;

// hard error / connection
pub const CONNECTION_FORCED: AmqpReplyCode = 320;
pub const INVALID_PATH: AmqpReplyCode = 402;
pub const FRAME_ERROR: AmqpReplyCode = 501;
pub const SYNTAX_ERROR: AmqpReplyCode = 502;
pub const COMMAND_INVALID: AmqpReplyCode = 503;
pub const CHANNEL_ERROR: AmqpReplyCode = 504;
pub const UNEXPECTED_FRAME: AmqpReplyCode = 505;
pub const RESOURCE_ERROR: AmqpReplyCode = 506;
pub const NOT_ALLOWED: AmqpReplyCode = 530;
pub const NOT_IMPLEMENTED: AmqpReplyCode = 540;
pub const INTERNAL_ERROR: AmqpReplyCode = 541;

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
