//! The work item envelope and its mapping onto AMQP message properties.

use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable},
    BasicProperties,
};

/// Header carrying the number of times an item has been re-published.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Delivery-scoped token used to acknowledge or reject one delivery instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

/// One logical unit of work: an opaque payload plus its retry metadata.
///
/// `properties` are the message properties the item arrived with. They are
/// carried through unchanged so a re-published copy keeps its content type
/// and any producer headers; only `x-retry-count` is rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub properties: BasicProperties,
}

impl WorkItem {
    /// A freshly ingested item that has never been retried.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            retry_count: 0,
            properties: BasicProperties::default(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.properties = self.properties.with_content_type(content_type.into());
        self
    }

    /// The copy that gets re-published after a failed attempt.
    pub fn next_attempt(&self, retry_count: u32) -> Self {
        Self {
            payload: self.payload.clone(),
            retry_count,
            properties: self.properties.clone(),
        }
    }

    /// Rebuilds an item from a received payload and its message properties.
    pub fn from_amqp(payload: Vec<u8>, properties: BasicProperties) -> Self {
        Self {
            payload,
            retry_count: retry_count_from_properties(&properties),
            properties,
        }
    }

    /// The properties to publish this item with: the carried properties,
    /// made persistent, with `x-retry-count` replaced.
    ///
    /// The retry header is left out while `retry_count` is 0, so first
    /// deliveries look exactly like messages published by the ingestion API.
    pub fn publish_properties(&self) -> BasicProperties {
        let properties = self.properties.clone().with_delivery_mode(PERSISTENT);
        let carried = properties.headers().clone();

        let mut headers = FieldTable::default();
        if let Some(carried) = &carried {
            for (key, value) in carried.inner() {
                if key.as_str() != RETRY_COUNT_HEADER {
                    headers.insert(key.clone(), value.clone());
                }
            }
        }
        if self.retry_count > 0 {
            headers.insert(
                RETRY_COUNT_HEADER.into(),
                AMQPValue::LongLongInt(i64::from(self.retry_count)),
            );
        }

        if carried.is_none() && headers.inner().is_empty() {
            return properties;
        }
        properties.with_headers(headers)
    }
}

/// A work item as handed to a worker, tagged with its delivery instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub tag: DeliveryTag,
    pub item: WorkItem,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        let item = WorkItem::from_amqp(delivery.data, delivery.properties);
        Self {
            tag: DeliveryTag(delivery.delivery_tag),
            item,
        }
    }
}

/// Reads `x-retry-count`, accepting any integer encoding a producer may
/// have used. Missing, negative or non-integer values count as 0.
pub fn retry_count_from_properties(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers().as_ref() else {
        return 0;
    };

    let count: i128 = match headers.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::ShortShortInt(v)) => (*v).into(),
        Some(AMQPValue::ShortShortUInt(v)) => (*v).into(),
        Some(AMQPValue::ShortInt(v)) => (*v).into(),
        Some(AMQPValue::ShortUInt(v)) => (*v).into(),
        Some(AMQPValue::LongInt(v)) => (*v).into(),
        Some(AMQPValue::LongUInt(v)) => (*v).into(),
        Some(AMQPValue::LongLongInt(v)) => (*v).into(),
        _ => 0,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_header(value: AMQPValue) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), value);
        BasicProperties::default().with_headers(headers)
    }

    #[test]
    fn absent_header_reads_as_zero() {
        assert_eq!(retry_count_from_properties(&BasicProperties::default()), 0);
        assert_eq!(
            retry_count_from_properties(&BasicProperties::default().with_headers(FieldTable::default())),
            0
        );
        assert_eq!(
            WorkItem::from_amqp(b"{}".to_vec(), BasicProperties::default()).retry_count,
            WorkItem::from_amqp(b"{}".to_vec(), with_header(AMQPValue::LongLongInt(0))).retry_count
        );
    }

    #[test]
    fn accepts_any_integer_width() {
        assert_eq!(retry_count_from_properties(&with_header(AMQPValue::ShortShortUInt(2))), 2);
        assert_eq!(retry_count_from_properties(&with_header(AMQPValue::ShortInt(3))), 3);
        assert_eq!(retry_count_from_properties(&with_header(AMQPValue::LongInt(4))), 4);
        assert_eq!(retry_count_from_properties(&with_header(AMQPValue::LongLongInt(5))), 5);
    }

    #[test]
    fn garbage_header_reads_as_zero() {
        assert_eq!(retry_count_from_properties(&with_header(AMQPValue::LongLongInt(-7))), 0);
        assert_eq!(
            retry_count_from_properties(&with_header(AMQPValue::LongString("3".into()))),
            0
        );
    }

    #[test]
    fn first_attempt_has_no_retry_header() {
        let properties = WorkItem::new(b"hello".to_vec()).publish_properties();
        assert!(properties.headers().is_none());
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
    }

    #[test]
    fn retried_copy_carries_header_and_payload() {
        let original = WorkItem::new(b"hello".to_vec());
        let retried = original.next_attempt(1);
        let properties = retried.publish_properties();

        assert_eq!(retried.payload, original.payload);
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
        assert_eq!(retry_count_from_properties(&properties), 1);
        assert_eq!(WorkItem::from_amqp(retried.payload.clone(), properties).retry_count, 1);
    }

    #[test]
    fn retried_copy_keeps_delivered_properties() {
        let mut headers = FieldTable::default();
        headers.insert("x-trace-id".into(), AMQPValue::LongString("abc-123".into()));
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(1));
        let delivered = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_headers(headers);

        let item = WorkItem::from_amqp(b"hello".to_vec(), delivered);
        assert_eq!(item.retry_count, 1);

        let properties = item.next_attempt(2).publish_properties();
        let headers = properties.headers().clone().unwrap();

        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("text/plain")
        );
        assert_eq!(
            headers.inner().get("x-trace-id"),
            Some(&AMQPValue::LongString("abc-123".into()))
        );
        assert_eq!(headers.inner().len(), 2);
        assert_eq!(retry_count_from_properties(&properties), 2);
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
    }

    #[test]
    fn retry_header_is_dropped_when_count_resets() {
        let item = WorkItem::from_amqp(b"hello".to_vec(), with_header(AMQPValue::LongLongInt(3)));

        let properties = item.next_attempt(0).publish_properties();

        assert_eq!(properties.headers().as_ref().map(|h| h.inner().len()), Some(0));
        assert_eq!(retry_count_from_properties(&properties), 0);
    }
}
