use crate::core::events::{EventPayload, MarketEvent, PriceTick, Timestamp, TradeSignal};
use crate::transport::{Decoded, FrameError, Inbound};

/// Turns decoded inbound frames into `MarketEvent`s
///
/// Events leave the normalizer with `sequence == 0`; the pipeline stamps the
/// arrival order when it publishes them.
#[derive(Debug, Default, Clone, Copy)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a decoded frame; `Ok(None)` for frames that carry no market data
    pub fn normalize(
        &self,
        decoded: Decoded,
        received_at: Timestamp,
    ) -> Result<Option<MarketEvent>, FrameError> {
        match decoded.message {
            Inbound::Price {
                asset,
                price,
                timestamp,
            } => {
                if !asset.is_valid() {
                    return Err(FrameError::Malformed(format!("invalid asset '{}'", asset)));
                }
                if !price.is_positive() {
                    return Err(FrameError::Malformed(format!(
                        "non-positive price {} for {}",
                        price, asset
                    )));
                }
                Ok(Some(MarketEvent {
                    sequence: 0,
                    asset: Some(asset),
                    timestamp: timestamp.unwrap_or(received_at),
                    payload: EventPayload::Price(PriceTick { price }),
                }))
            }
            Inbound::Signal(signal) => self.normalize_signal(signal, received_at).map(Some),
            Inbound::Unknown => {
                let (kind, asset, raw) = decoded.unknown.ok_or_else(|| {
                    FrameError::Malformed("unknown frame without envelope".to_string())
                })?;
                Ok(Some(MarketEvent {
                    sequence: 0,
                    asset,
                    timestamp: raw
                        .get("timestamp")
                        .and_then(|t| t.as_u64())
                        .unwrap_or(received_at),
                    payload: EventPayload::Unknown { kind, raw },
                }))
            }
            _ => Ok(None),
        }
    }

    /// Validate and wrap an externally produced signal
    pub fn normalize_signal(
        &self,
        signal: TradeSignal,
        received_at: Timestamp,
    ) -> Result<MarketEvent, FrameError> {
        if !signal.asset.is_valid() {
            return Err(FrameError::Malformed(format!(
                "invalid signal asset '{}'",
                signal.asset
            )));
        }
        if let Some(strength) = signal.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(FrameError::Malformed(format!(
                    "signal strength {} outside [0, 1]",
                    strength
                )));
            }
        }

        Ok(MarketEvent {
            sequence: 0,
            asset: Some(signal.asset.clone()),
            timestamp: signal.timestamp.unwrap_or(received_at),
            payload: EventPayload::Signal(signal),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::Direction;
    use crate::types::{Asset, Price};
    use rust_decimal::Decimal;

    fn decode(text: &str) -> Decoded {
        Inbound::decode(text).unwrap()
    }

    #[test]
    fn test_price_frame() {
        let event = Normalizer::new()
            .normalize(decode(r#"{"type":"price","asset":"EURUSD_otc","price":"1.0831"}"#), 42)
            .unwrap()
            .unwrap();
        assert_eq!(event.asset, Some(Asset::new("EURUSD_otc")));
        assert_eq!(event.timestamp, 42);
        assert_eq!(event.price(), Some(Price::new(Decimal::new(10831, 4))));
    }

    #[test]
    fn test_frame_timestamp_wins() {
        let event = Normalizer::new()
            .normalize(
                decode(r#"{"type":"price","asset":"EURUSD","price":1.1,"timestamp":7}"#),
                42,
            )
            .unwrap()
            .unwrap();
        assert_eq!(event.timestamp, 7);
    }

    #[test]
    fn test_invalid_price_is_malformed() {
        let result = Normalizer::new()
            .normalize(decode(r#"{"type":"price","asset":"EURUSD","price":"0"}"#), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_signal_strength_is_checked() {
        let normalizer = Normalizer::new();
        let ok = TradeSignal::new("BTCUSD", Direction::Call).with_strength(0.5);
        assert!(normalizer.normalize_signal(ok, 1).unwrap().is_signal());

        let too_strong = TradeSignal::new("BTCUSD", Direction::Call).with_strength(1.5);
        assert!(normalizer.normalize_signal(too_strong, 1).is_err());
    }

    #[test]
    fn test_unknown_frame_is_forwarded() {
        let event = Normalizer::new()
            .normalize(decode(r#"{"type":"candle","asset":"EURUSD","open":1.0}"#), 9)
            .unwrap()
            .unwrap();
        match event.payload {
            EventPayload::Unknown { kind, raw } => {
                assert_eq!(kind, "candle");
                assert_eq!(raw["open"], 1.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(event.timestamp, 9);
    }

    #[test]
    fn test_non_market_frames_are_skipped() {
        let result = Normalizer::new()
            .normalize(decode(r#"{"type":"order_cancelled","key":"k1"}"#), 1)
            .unwrap();
        assert!(result.is_none());
    }
}
