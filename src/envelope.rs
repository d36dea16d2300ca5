/// Message container exchanged over the broker.
///
/// `Envelope` bundles the routing pattern, the application payload and the
/// delivery options. Its JSON form is the wire contract shared by publishers
/// and consumers:
///
/// ```json
/// { "pattern": "user.created", "data": { "id": 42 }, "options": { "deliveryMode": 2 } }
/// ```
///
/// ## Design
///
/// - `pattern` names the logical destination and doubles as the routing key
/// - `data` is an arbitrary composite JSON value (object or array)
/// - `options` carries broker hints, currently only the delivery mode
///
/// Envelopes are normally built by [`Gateway`](crate::Gateway), which
/// validates the parts before assembling them.
///
/// ## Example
///
/// ```rust
/// use letterbox::{DeliveryMode, Envelope};
/// use serde_json::json;
///
/// let envelope = Envelope::new("user.created", json!({ "id": 42 }), DeliveryMode::Persistent);
///
/// assert_eq!(
///     serde_json::to_value(&envelope).unwrap(),
///     json!({ "pattern": "user.created", "data": { "id": 42 }, "options": { "deliveryMode": 2 } }),
/// );
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    /// Destination pattern and routing key.
    pub pattern: String,
    /// Message payload.
    pub data: serde_json::Value,
    /// Delivery options.
    pub options: EnvelopeOptions,
}

impl Envelope {
    /// Assemble an envelope from its parts without validation.
    pub fn new(
        pattern: impl Into<String>,
        data: serde_json::Value,
        delivery_mode: DeliveryMode,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            data,
            options: EnvelopeOptions { delivery_mode },
        }
    }

    /// Shortcut for `options.delivery_mode`.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.options.delivery_mode
    }
}

/// Broker hints attached to an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeOptions {
    pub delivery_mode: DeliveryMode,
}

/// Persistence hint for a published message.
///
/// Serialized as the AMQP integer code: `1` for non-persistent, `2` for
/// persistent. Any other code is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeliveryMode {
    /// The broker may drop the message on restart.
    NonPersistent,
    /// The broker writes the message to disk.
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    pub fn code(self) -> u8 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

impl From<DeliveryMode> for u8 {
    fn from(value: DeliveryMode) -> Self {
        value.code()
    }
}

impl TryFrom<i64> for DeliveryMode {
    type Error = UnknownDeliveryMode;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeliveryMode::NonPersistent),
            2 => Ok(DeliveryMode::Persistent),
            other => Err(UnknownDeliveryMode(other)),
        }
    }
}

impl TryFrom<u8> for DeliveryMode {
    type Error = UnknownDeliveryMode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        DeliveryMode::try_from(i64::from(value))
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Integer that is not a valid [`DeliveryMode`] code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownDeliveryMode(pub i64);

impl std::fmt::Display for UnknownDeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown delivery mode {}", self.0)
    }
}

impl std::error::Error for UnknownDeliveryMode {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delivery_mode_defaults_to_persistent() {
        assert_eq!(DeliveryMode::default(), DeliveryMode::Persistent);
        assert_eq!(EnvelopeOptions::default().delivery_mode.code(), 2);
    }

    #[test]
    fn delivery_mode_accepts_only_amqp_codes() {
        assert_eq!(DeliveryMode::try_from(1i64), Ok(DeliveryMode::NonPersistent));
        assert_eq!(DeliveryMode::try_from(2i64), Ok(DeliveryMode::Persistent));
        assert_eq!(DeliveryMode::try_from(0i64), Err(UnknownDeliveryMode(0)));
        assert_eq!(DeliveryMode::try_from(3i64), Err(UnknownDeliveryMode(3)));
        assert_eq!(DeliveryMode::try_from(-1i64), Err(UnknownDeliveryMode(-1)));
    }

    #[test]
    fn envelope_matches_wire_contract() {
        let envelope = Envelope::new("orders", json!({ "sku": "A-1" }), DeliveryMode::NonPersistent);
        let wire = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            wire,
            json!({
                "pattern": "orders",
                "data": { "sku": "A-1" },
                "options": { "deliveryMode": 1 }
            })
        );

        let back: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn envelope_with_unknown_delivery_mode_does_not_deserialize() {
        let wire = json!({
            "pattern": "orders",
            "data": {},
            "options": { "deliveryMode": 3 }
        });

        assert!(serde_json::from_value::<Envelope>(wire).is_err());
    }
}
