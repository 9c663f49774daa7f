//! Method frame payloads of the `connection`, `channel`, `exchange`, `queue`
//! and `basic` classes.
//!
//! Every method is declared once in the table below with its fields in wire
//! order; `amqp_serde` serializes them as they are declared. Consecutive
//! `bit` fields share one octet, kept as a `bits` field with named flags.

use std::fmt;

use amqp_serde::{from_bytes, to_bytes};
use serde::{Deserialize, Serialize};

use super::{
    short_str, AmqpReplyCode, Boolean, Error, FieldTable, Frame, LongLongUint, LongStr, LongUint,
    Octect, ShortStr, ShortUint, REPLY_SUCCESS,
};

/// `(class-id, method-id)` pair identifying a method on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId {
    pub class_id: ShortUint,
    pub method_id: ShortUint,
}

impl MethodId {
    pub const fn new(class_id: ShortUint, method_id: ShortUint) -> Self {
        Self {
            class_id,
            method_id,
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.class_id, self.method_id)
    }
}

/// size of the serialized `MethodId` leading every method payload
const METHOD_ID_SIZE: usize = 4;

////////////////////////////////////////////////////////////////////////
// macros should appear before use
macro_rules! define_methods {
    ($(
        $(#[$meta:meta])*
        $name:ident($class_id:literal, $method_id:literal) {
            $($field:ident: $ty:ty),* $(,)?
        }
    )+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
            pub struct $name {
                $(pub $field: $ty,)*
            }

            impl $name {
                pub const ID: MethodId = MethodId::new($class_id, $method_id);

                pub fn into_frame(self) -> Frame {
                    Frame::Method(Method::$name(self))
                }
            }

            impl From<$name> for Method {
                fn from(method: $name) -> Self {
                    Method::$name(method)
                }
            }
        )+

        /// Any method frame payload.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Method {
            $($name($name),)+
        }

        impl Method {
            pub fn id(&self) -> MethodId {
                match self {
                    $(Method::$name(_) => $name::ID,)+
                }
            }

            /// Method id followed by the arguments.
            pub(crate) fn encode(&self) -> Result<Vec<u8>, Error> {
                let mut raw = to_bytes(&self.id())?;
                let args = match self {
                    $(Method::$name(m) => to_bytes(m)?,)+
                };
                raw.extend_from_slice(&args);
                Ok(raw)
            }

            pub(crate) fn decode(raw: &[u8]) -> Result<Self, Error> {
                let (id, args) = match raw.get(..METHOD_ID_SIZE) {
                    Some(id) => (from_bytes::<MethodId>(id)?, &raw[METHOD_ID_SIZE..]),
                    None => return Err(Error::Corrupted),
                };
                match (id.class_id, id.method_id) {
                    $(($class_id, $method_id) => Ok(Method::$name(from_bytes::<$name>(args)?)),)+
                    _ => Err(Error::UnknownMethod(id.class_id, id.method_id)),
                }
            }
        }
    };
}

/// Accessors for the flags packed into a method's `bits` octet, low bit first.
macro_rules! impl_bit_flags {
    ($(
        $name:ident {
            $($flag:ident, $setter:ident = $mask:literal;)+
        }
    )+) => {
        $(
            impl $name {
                $(
                    pub fn $flag(&self) -> bool {
                        self.bits & $mask != 0
                    }

                    pub fn $setter(&mut self, value: bool) {
                        if value {
                            self.bits |= $mask;
                        } else {
                            self.bits &= !$mask;
                        }
                    }
                )+
            }
        )+
    };
}

define_methods! {
    ConnectionStart(10, 10) {
        version_major: Octect,
        version_minor: Octect,
        server_properties: FieldTable,
        mechanisms: LongStr,
        locales: LongStr,
    }
    ConnectionStartOk(10, 11) {
        client_properties: FieldTable,
        mechanism: ShortStr,
        response: LongStr,
        locale: ShortStr,
    }
    ConnectionSecure(10, 20) {
        challenge: LongStr,
    }
    ConnectionSecureOk(10, 21) {
        response: LongStr,
    }
    ConnectionTune(10, 30) {
        channel_max: ShortUint,
        frame_max: LongUint,
        heartbeat: ShortUint,
    }
    ConnectionTuneOk(10, 31) {
        channel_max: ShortUint,
        frame_max: LongUint,
        heartbeat: ShortUint,
    }
    ConnectionOpen(10, 40) {
        virtual_host: ShortStr,
        reserved_1: ShortStr,
        reserved_2: Boolean,
    }
    ConnectionOpenOk(10, 41) {
        reserved_1: ShortStr,
    }
    ConnectionClose(10, 50) {
        reply_code: AmqpReplyCode,
        reply_text: ShortStr,
        class_id: ShortUint,
        method_id: ShortUint,
    }
    ConnectionCloseOk(10, 51) {}
    ConnectionBlocked(10, 60) {
        reason: ShortStr,
    }
    ConnectionUnblocked(10, 61) {}

    ChannelOpen(20, 10) {
        reserved_1: ShortStr,
    }
    ChannelOpenOk(20, 11) {
        reserved_1: LongStr,
    }
    ChannelFlow(20, 20) {
        active: Boolean,
    }
    ChannelFlowOk(20, 21) {
        active: Boolean,
    }
    ChannelClose(20, 40) {
        reply_code: AmqpReplyCode,
        reply_text: ShortStr,
        class_id: ShortUint,
        method_id: ShortUint,
    }
    ChannelCloseOk(20, 41) {}

    ExchangeDeclare(40, 10) {
        reserved_1: ShortUint,
        exchange: ShortStr,
        exchange_type: ShortStr,
        bits: Octect,
        arguments: FieldTable,
    }
    ExchangeDeclareOk(40, 11) {}
    ExchangeDelete(40, 20) {
        reserved_1: ShortUint,
        exchange: ShortStr,
        bits: Octect,
    }
    ExchangeDeleteOk(40, 21) {}

    QueueDeclare(50, 10) {
        reserved_1: ShortUint,
        queue: ShortStr,
        bits: Octect,
        arguments: FieldTable,
    }
    QueueDeclareOk(50, 11) {
        queue: ShortStr,
        message_count: LongUint,
        consumer_count: LongUint,
    }
    QueueBind(50, 20) {
        reserved_1: ShortUint,
        queue: ShortStr,
        exchange: ShortStr,
        routing_key: ShortStr,
        no_wait: Boolean,
        arguments: FieldTable,
    }
    QueueBindOk(50, 21) {}
    QueuePurge(50, 30) {
        reserved_1: ShortUint,
        queue: ShortStr,
        no_wait: Boolean,
    }
    QueuePurgeOk(50, 31) {
        message_count: LongUint,
    }
    QueueDelete(50, 40) {
        reserved_1: ShortUint,
        queue: ShortStr,
        bits: Octect,
    }
    QueueDeleteOk(50, 41) {
        message_count: LongUint,
    }
    QueueUnbind(50, 50) {
        reserved_1: ShortUint,
        queue: ShortStr,
        exchange: ShortStr,
        routing_key: ShortStr,
        arguments: FieldTable,
    }
    QueueUnbindOk(50, 51) {}

    BasicQos(60, 10) {
        prefetch_size: LongUint,
        prefetch_count: ShortUint,
        global: Boolean,
    }
    BasicQosOk(60, 11) {}
    BasicConsume(60, 20) {
        reserved_1: ShortUint,
        queue: ShortStr,
        consumer_tag: ShortStr,
        bits: Octect,
        arguments: FieldTable,
    }
    BasicConsumeOk(60, 21) {
        consumer_tag: ShortStr,
    }
    BasicCancel(60, 30) {
        consumer_tag: ShortStr,
        no_wait: Boolean,
    }
    BasicCancelOk(60, 31) {
        consumer_tag: ShortStr,
    }
    BasicPublish(60, 40) {
        reserved_1: ShortUint,
        exchange: ShortStr,
        routing_key: ShortStr,
        bits: Octect,
    }
    BasicReturn(60, 50) {
        reply_code: AmqpReplyCode,
        reply_text: ShortStr,
        exchange: ShortStr,
        routing_key: ShortStr,
    }
    BasicDeliver(60, 60) {
        consumer_tag: ShortStr,
        delivery_tag: LongLongUint,
        redelivered: Boolean,
        exchange: ShortStr,
        routing_key: ShortStr,
    }
    BasicGet(60, 70) {
        reserved_1: ShortUint,
        queue: ShortStr,
        no_ack: Boolean,
    }
    BasicGetOk(60, 71) {
        delivery_tag: LongLongUint,
        redelivered: Boolean,
        exchange: ShortStr,
        routing_key: ShortStr,
        message_count: LongUint,
    }
    BasicGetEmpty(60, 72) {
        reserved_1: ShortStr,
    }
    BasicAck(60, 80) {
        delivery_tag: LongLongUint,
        multiple: Boolean,
    }
    BasicReject(60, 90) {
        delivery_tag: LongLongUint,
        requeue: Boolean,
    }
    BasicNack(60, 120) {
        delivery_tag: LongLongUint,
        bits: Octect,
    }
}

impl_bit_flags! {
    ExchangeDeclare {
        passive, set_passive = 0b0000_0001;
        durable, set_durable = 0b0000_0010;
        auto_delete, set_auto_delete = 0b0000_0100;
        internal, set_internal = 0b0000_1000;
        no_wait, set_no_wait = 0b0001_0000;
    }
    ExchangeDelete {
        if_unused, set_if_unused = 0b0000_0001;
        no_wait, set_no_wait = 0b0000_0010;
    }
    QueueDeclare {
        passive, set_passive = 0b0000_0001;
        durable, set_durable = 0b0000_0010;
        exclusive, set_exclusive = 0b0000_0100;
        auto_delete, set_auto_delete = 0b0000_1000;
        no_wait, set_no_wait = 0b0001_0000;
    }
    QueueDelete {
        if_unused, set_if_unused = 0b0000_0001;
        if_empty, set_if_empty = 0b0000_0010;
        no_wait, set_no_wait = 0b0000_0100;
    }
    BasicConsume {
        no_local, set_no_local = 0b0000_0001;
        no_ack, set_no_ack = 0b0000_0010;
        exclusive, set_exclusive = 0b0000_0100;
        no_wait, set_no_wait = 0b0000_1000;
    }
    BasicPublish {
        mandatory, set_mandatory = 0b0000_0001;
        immediate, set_immediate = 0b0000_0010;
    }
    BasicNack {
        multiple, set_multiple = 0b0000_0001;
        requeue, set_requeue = 0b0000_0010;
    }
}

impl Method {
    /// Content-carrying methods are followed by a content header and body frames.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish(_)
                | Method::BasicReturn(_)
                | Method::BasicDeliver(_)
                | Method::BasicGetOk(_)
        )
    }
}

impl ConnectionClose {
    /// Graceful close initiated by the application.
    pub fn normal() -> Self {
        Self {
            reply_code: REPLY_SUCCESS,
            reply_text: short_str("Goodbye").unwrap_or_default(),
            class_id: 0,
            method_id: 0,
        }
    }
}

impl ChannelClose {
    pub fn normal() -> Self {
        Self {
            reply_code: REPLY_SUCCESS,
            reply_text: short_str("Goodbye").unwrap_or_default(),
            class_id: 0,
            method_id: 0,
        }
    }
}
