//! AMQP domain types are the ones of `amqp_serde`. Strings coming from the
//! application go through the checked conversions below, an over-long value
//! is refused instead of being cut.

pub use amqp_serde::types::{
    AmqpChannelId, AmqpReplyCode, Boolean, FieldName, FieldTable, FieldValue, LongLongUint,
    LongStr, LongUint, Octect, ShortStr, ShortUint, TimeStamp,
};

use super::Error;

pub fn short_str(value: impl Into<String>) -> Result<ShortStr, Error> {
    let value = value.into();
    let len = value.len();
    ShortStr::try_from(value).map_err(|_| Error::StringTooLong(len, u8::MAX as usize))
}

pub fn long_str(value: impl Into<String>) -> Result<LongStr, Error> {
    let value = value.into();
    let len = value.len();
    LongStr::try_from(value).map_err(|_| Error::StringTooLong(len, u32::MAX as usize))
}

/// Adds `key: value` to `table`.
pub fn insert_field(
    table: &mut FieldTable,
    key: &str,
    value: impl Into<FieldValue>,
) -> Result<(), Error> {
    table.insert(short_str(key)?, value.into());
    Ok(())
}

/// Long string table value.
pub fn str_field(value: impl Into<String>) -> Result<FieldValue, Error> {
    Ok(FieldValue::S(long_str(value)?))
}

pub fn get_field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a FieldValue> {
    table.get(&short_str(key).ok()?)
}
