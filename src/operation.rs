//! Operation kinds and their defaults.
//!
//! An operation key partitions rate-limit and circuit-breaker state. The built-in
//! [`OperationKind`]s cover the calls a multimodal assistant typically makes; any other
//! string key works as well and falls back to the default rules.

use crate::rate_limit::RateLimitRule;
use std::fmt;
use std::str::FromStr;

/// The kinds of generative calls, from cheapest to most expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Text in, text out.
    Text,
    /// Text plus an image in, text out.
    Multimodal,
    /// Text plus an image in, structured JSON (masks, boxes) out.
    Segmentation,
    /// Text in, image out.
    ImageGeneration,
}

impl OperationKind {
    /// All kinds, in order.
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Text,
        OperationKind::Multimodal,
        OperationKind::Segmentation,
        OperationKind::ImageGeneration,
    ];

    /// The operation key used for rate limiting and circuit breaking.
    pub fn key(self) -> &'static str {
        match self {
            OperationKind::Text => "gemini_text",
            OperationKind::Multimodal => "gemini_multimodal",
            OperationKind::Segmentation => "gemini_segmentation",
            OperationKind::ImageGeneration => "gemini_image_generation",
        }
    }

    /// The default admission rule: cheaper calls get a higher ceiling.
    pub fn default_rate_limit(self) -> RateLimitRule {
        match self {
            OperationKind::Text => RateLimitRule::per_minute(10),
            OperationKind::Multimodal => RateLimitRule::per_minute(5),
            OperationKind::Segmentation => RateLimitRule::per_minute(3),
            OperationKind::ImageGeneration => RateLimitRule::per_minute(2),
        }
    }

    /// The model used when the request builder is not told otherwise.
    pub fn default_model(self) -> &'static str {
        match self {
            OperationKind::Text | OperationKind::Multimodal | OperationKind::Segmentation => {
                "gemini-2.0-flash"
            }
            OperationKind::ImageGeneration => "gemini-2.0-flash-preview-image-generation",
        }
    }

    /// Whether requests of this kind carry an image.
    pub fn takes_image(self) -> bool {
        matches!(self, OperationKind::Multimodal | OperationKind::Segmentation)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.key() == s)
            .ok_or_else(|| crate::Error::ConfigurationError(format!("unknown operation '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_round_trip_and_ceilings_decrease_with_cost() {
        let mut previous = usize::MAX;
        for kind in OperationKind::ALL {
            assert_eq!(kind.key().parse::<OperationKind>().unwrap(), kind);
            let rule = kind.default_rate_limit();
            assert!(rule.max_requests < previous);
            previous = rule.max_requests;
        }
        assert!("gemini_video".parse::<OperationKind>().is_err());
    }
}
