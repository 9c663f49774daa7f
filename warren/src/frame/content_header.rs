use std::fmt;

use serde::{
    de::{self, SeqAccess, Visitor},
    ser::{self, SerializeTuple},
    Deserialize, Deserializer, Serialize, Serializer,
};

use super::{Error, FieldTable, LongLongUint, Octect, ShortStr, ShortUint, TimeStamp};

/// Content header frame payload: size of the body that follows plus message properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentHeader {
    pub class_id: ShortUint,
    pub weight: ShortUint,
    pub body_size: LongLongUint,
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// class id of `basic`, the only class carrying content in 0-9-1
    pub const BASIC_CLASS: ShortUint = 60;

    pub fn new(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: Self::BASIC_CLASS,
            weight: 0,
            body_size,
            properties,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

/// Message properties of the `basic` class.
///
/// Every property is optional; only the ones that are set go on the wire,
/// announced through the property flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    content_type: Option<String>,
    content_encoding: Option<String>,
    headers: Option<FieldTable>,
    delivery_mode: Option<Octect>,
    priority: Option<Octect>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    expiration: Option<String>,
    message_id: Option<String>,
    timestamp: Option<TimeStamp>,
    message_type: Option<String>,
    user_id: Option<String>,
    app_id: Option<String>,
    cluster_id: Option<String>,
}

macro_rules! impl_shortstr_setters {
    ($($field:ident => $setter:ident),+ $(,)?) => {
        impl BasicProperties {
            $(
                pub fn $setter(&mut self, value: &str) -> &mut Self {
                    self.$field = Some(value.to_owned());
                    self
                }
            )+
        }
    };
}

impl_shortstr_setters! {
    content_type => set_content_type,
    content_encoding => set_content_encoding,
    correlation_id => set_correlation_id,
    reply_to => set_reply_to,
    expiration => set_expiration,
    message_id => set_message_id,
    message_type => set_message_type,
    user_id => set_user_id,
    app_id => set_app_id,
    cluster_id => set_cluster_id,
}

impl BasicProperties {
    pub fn set_headers(&mut self, headers: FieldTable) -> &mut Self {
        self.headers = Some(headers);
        self
    }

    pub fn set_delivery_mode(&mut self, delivery_mode: u8) -> &mut Self {
        self.delivery_mode = Some(delivery_mode);
        self
    }

    pub fn set_priority(&mut self, priority: u8) -> &mut Self {
        self.priority = Some(priority);
        self
    }

    pub fn set_timestamp(&mut self, timestamp: u64) -> &mut Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.headers.as_ref()
    }

    pub fn delivery_mode(&self) -> Option<u8> {
        self.delivery_mode
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn expiration(&self) -> Option<&str> {
        self.expiration.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    fn short_strings(&self) -> [&Option<String>; 10] {
        [
            &self.content_type,
            &self.content_encoding,
            &self.correlation_id,
            &self.reply_to,
            &self.expiration,
            &self.message_id,
            &self.message_type,
            &self.user_id,
            &self.app_id,
            &self.cluster_id,
        ]
    }

    /// Fails if a string property does not fit in a short string.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        match self
            .short_strings()
            .into_iter()
            .flatten()
            .find(|value| value.len() > u8::MAX as usize)
        {
            Some(value) => Err(Error::StringTooLong(value.len(), u8::MAX as usize)),
            None => Ok(()),
        }
    }

    /// One bit per property, the first property is the most significant bit.
    fn property_flags(&self) -> ShortUint {
        let present = [
            self.content_type.is_some(),
            self.content_encoding.is_some(),
            self.headers.is_some(),
            self.delivery_mode.is_some(),
            self.priority.is_some(),
            self.correlation_id.is_some(),
            self.reply_to.is_some(),
            self.expiration.is_some(),
            self.message_id.is_some(),
            self.timestamp.is_some(),
            self.message_type.is_some(),
            self.user_id.is_some(),
            self.app_id.is_some(),
            self.cluster_id.is_some(),
        ];
        present
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .fold(0, |flags, (i, _)| flags | (1 << (15 - i)))
    }
}

fn to_short_str<E: ser::Error>(value: &Option<String>) -> Result<Option<ShortStr>, E> {
    value
        .as_deref()
        .map(|v| {
            ShortStr::try_from(v)
                .map_err(|_| E::custom(format!("short string of {} bytes", v.len())))
        })
        .transpose()
}

impl Serialize for BasicProperties {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // absent properties serialize as nothing
        let mut seq = serializer.serialize_tuple(15)?;
        seq.serialize_element(&self.property_flags())?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.content_type)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.content_encoding)?)?;
        seq.serialize_element(&self.headers)?;
        seq.serialize_element(&self.delivery_mode)?;
        seq.serialize_element(&self.priority)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.correlation_id)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.reply_to)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.expiration)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.message_id)?)?;
        seq.serialize_element(&self.timestamp)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.message_type)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.user_id)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.app_id)?)?;
        seq.serialize_element(&to_short_str::<S::Error>(&self.cluster_id)?)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for BasicProperties {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BasicPropertiesVisitor;

        impl<'de> Visitor<'de> for BasicPropertiesVisitor {
            type Value = BasicProperties;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct BasicProperties")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let flags: ShortUint = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let mut index = 0;
                // reads the next property if its flag is set
                macro_rules! next {
                    ($ty:ty) => {{
                        index += 1;
                        if flags & (1 << (16 - index)) != 0 {
                            let value: $ty = seq
                                .next_element()?
                                .ok_or_else(|| de::Error::invalid_length(index, &self))?;
                            Some(value)
                        } else {
                            None
                        }
                    }};
                }
                Ok(BasicProperties {
                    content_type: next!(ShortStr).map(String::from),
                    content_encoding: next!(ShortStr).map(String::from),
                    headers: next!(FieldTable),
                    delivery_mode: next!(Octect),
                    priority: next!(Octect),
                    correlation_id: next!(ShortStr).map(String::from),
                    reply_to: next!(ShortStr).map(String::from),
                    expiration: next!(ShortStr).map(String::from),
                    message_id: next!(ShortStr).map(String::from),
                    timestamp: next!(TimeStamp),
                    message_type: next!(ShortStr).map(String::from),
                    user_id: next!(ShortStr).map(String::from),
                    app_id: next!(ShortStr).map(String::from),
                    cluster_id: next!(ShortStr).map(String::from),
                })
            }
        }

        const FIELDS: &[&str] = &[
            "property_flags",
            "content_type",
            "content_encoding",
            "headers",
            "delivery_mode",
            "priority",
            "correlation_id",
            "reply_to",
            "expiration",
            "message_id",
            "timestamp",
            "message_type",
            "user_id",
            "app_id",
            "cluster_id",
        ];
        deserializer.deserialize_struct("BasicProperties", FIELDS, BasicPropertiesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use amqp_serde::{from_bytes, to_bytes};

    use super::{BasicProperties, ContentHeader};
    use crate::frame::{insert_field, str_field, Error, FieldTable, DELIVERY_MODE_PERSISTENT};

    #[test]
    fn test_sparse_properties_keep_flag_positions() {
        let mut headers = FieldTable::new();
        insert_field(&mut headers, "date", str_field("2022-11").unwrap()).unwrap();
        let props = BasicProperties::default()
            .set_content_type("application/json")
            .set_headers(headers)
            .set_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .set_app_id("warren")
            .finish();

        let raw = to_bytes(&ContentHeader::new(42, props.clone())).unwrap();
        // content_type, headers, delivery_mode, app_id
        assert_eq!([0b1011_0000, 0b0000_1000], [raw[12], raw[13]]);

        let decoded: ContentHeader = from_bytes(&raw).unwrap();
        assert_eq!(42, decoded.body_size);
        assert_eq!(props, decoded.properties);
        assert_eq!(Some("warren"), decoded.properties.app_id());
        assert_eq!(None, decoded.properties.reply_to());
    }

    #[test]
    fn test_over_long_property_is_refused() {
        let props = BasicProperties::default()
            .set_correlation_id(&"c".repeat(300))
            .finish();
        assert_eq!(Err(Error::StringTooLong(300, 255)), props.validate());
        assert!(to_bytes(&ContentHeader::new(0, props)).is_err());
    }
}
