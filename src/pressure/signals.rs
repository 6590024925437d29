//! Exhaustion signal classification.
//!
//! Errors are matched by message text because the signals come from
//! heterogeneous layers (allocator, loader, remote SDKs) with no shared type.

use serde::Serialize;

use crate::config::PressureConfig;

/// A known class of resource-exhaustion error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureSignal {
    /// The runtime ran out of memory, handles or similar.
    InsufficientResources,
    /// A lazily loaded module could not be fetched or initialised.
    DynamicModuleLoad,
}

const INSUFFICIENT_RESOURCES_PATTERNS: &[&str] = &[
    "insufficient resources",
    "insufficient_resources",
    "out of memory",
    "resource exhausted",
    "resources exhausted",
    "too many open files",
];

const DYNAMIC_MODULE_PATTERNS: &[&str] = &[
    "failed to fetch dynamically imported module",
    "error loading dynamically imported module",
    "failed to load module",
    "loading chunk",
];

impl PressureSignal {
    /// Classify an error message, case-insensitively.
    pub fn classify(message: &str) -> Option<Self> {
        let lowered = message.to_lowercase();
        if DYNAMIC_MODULE_PATTERNS.iter().any(|p| lowered.contains(p)) {
            Some(PressureSignal::DynamicModuleLoad)
        } else if INSUFFICIENT_RESOURCES_PATTERNS
            .iter()
            .any(|p| lowered.contains(p))
        {
            Some(PressureSignal::InsufficientResources)
        } else {
            None
        }
    }

    /// Points this signal adds to the pressure score.
    pub fn weight(&self, config: &PressureConfig) -> f64 {
        match self {
            PressureSignal::InsufficientResources => config.insufficient_resources_weight,
            PressureSignal::DynamicModuleLoad => config.dynamic_module_weight,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureSignal::InsufficientResources => "insufficient_resources",
            PressureSignal::DynamicModuleLoad => "dynamic_module_load",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_known_signals() {
        assert_eq!(
            PressureSignal::classify("net::ERR_INSUFFICIENT_RESOURCES"),
            Some(PressureSignal::InsufficientResources)
        );
        assert_eq!(
            PressureSignal::classify("TypeError: Failed to fetch dynamically imported module: /a.js"),
            Some(PressureSignal::DynamicModuleLoad)
        );
        assert_eq!(
            PressureSignal::classify("Loading chunk 42 failed."),
            Some(PressureSignal::DynamicModuleLoad)
        );
    }

    #[test]
    fn test_ignores_unrelated_errors() {
        assert_eq!(PressureSignal::classify("404 Not Found"), None);
        assert_eq!(PressureSignal::classify("permission denied"), None);
    }

    #[test]
    fn test_default_weights() {
        let config = PressureConfig::default();
        assert_eq!(PressureSignal::InsufficientResources.weight(&config), 15.0);
        assert_eq!(PressureSignal::DynamicModuleLoad.weight(&config), 25.0);
    }
}
