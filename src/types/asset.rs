use serde::{Deserialize, Serialize};
use std::fmt;

/// Tradable instrument identifier (e.g., "EURUSD_otc")
/// Uses NewType pattern for type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset(String);

impl Asset {
    /// Create a new Asset from a string
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the underlying string as &str
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if asset is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// OTC instruments trade outside regular market hours
    pub fn is_otc(&self) -> bool {
        self.0.ends_with("_otc")
    }

    /// Basic validation: 3..=32 chars of alphanumerics, '_' or '#'
    pub fn is_valid(&self) -> bool {
        (3..=32).contains(&self.0.len())
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '#')
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Asset {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Asset {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Asset {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Asset {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_creation() {
        let asset = Asset::new("EURUSD");
        assert_eq!(asset.as_str(), "EURUSD");
        assert!(!asset.is_otc());
    }

    #[test]
    fn test_asset_otc() {
        assert!(Asset::from("EURUSD_otc").is_otc());
    }

    #[test]
    fn test_asset_validation() {
        assert!(Asset::new("EURUSD_otc").is_valid());
        assert!(Asset::new("#AAPL").is_valid());
        assert!(!Asset::new("").is_valid());
        assert!(!Asset::new("EUR USD").is_valid());
        assert!(!Asset::new("A".repeat(33)).is_valid());
    }

    #[test]
    fn test_asset_serialization() {
        let asset = Asset::new("BTCUSD");
        let json = serde_json::to_string(&asset).unwrap();
        assert_eq!(json, "\"BTCUSD\"");

        let deserialized: Asset = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, asset);
    }
}
