//! Configuration types for the interop kernel.
//!
//! All configuration structs deserialize with `serde` and fall back to their
//! defaults for missing fields, so partial TOML files are accepted.

use serde::{Deserialize, Serialize};

/// Number of bytes a single decoder instance may process before it is
/// replaced. Some host decoders misbehave past roughly 2 GiB of cumulative
/// input.
pub const DEFAULT_DECODER_BYTE_CEILING: u64 = 2_146_435_072;

/// How the handle table treats a free of an already freed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreePolicy {
    /// Double frees are ignored with a warning.
    Permissive,
    /// Double frees are reported as defects.
    Strict,
}

impl Default for FreePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Permissive
        }
    }
}

/// Configuration for the whole bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Handle table settings.
    pub handles: HandleTableConfig,
    /// String marshaling settings.
    pub strings: StringConfig,
}

impl BridgeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handle table configuration.
    pub fn with_handles(mut self, handles: HandleTableConfig) -> Self {
        self.handles = handles;
        self
    }

    /// Set the string marshaling configuration.
    pub fn with_strings(mut self, strings: StringConfig) -> Self {
        self.strings = strings;
        self
    }

    /// Set the free policy.
    pub fn with_free_policy(mut self, policy: FreePolicy) -> Self {
        self.handles.free_policy = policy;
        self
    }

    /// Set the maximum number of handle table slots.
    pub fn with_max_handles(mut self, max: u32) -> Self {
        self.handles.max_handles = max;
        self
    }

    /// Set the decoder byte ceiling.
    pub fn with_decoder_byte_ceiling(mut self, bytes: u64) -> Self {
        self.strings.decoder_byte_ceiling = bytes;
        self
    }

    /// Configuration that reports every lifetime violation.
    pub fn strict() -> Self {
        Self::default().with_free_policy(FreePolicy::Strict)
    }

    /// Configuration that tolerates double frees.
    pub fn permissive() -> Self {
        Self::default().with_free_policy(FreePolicy::Permissive)
    }
}

/// Configuration for the handle table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleTableConfig {
    /// Slots reserved up front, including the four sentinels.
    ///
    /// Defaults to 128.
    pub initial_capacity: u32,

    /// Maximum number of slots, including the four sentinels.
    ///
    /// Defaults to 1,048,576.
    pub max_handles: u32,

    /// Behavior on double free.
    pub free_policy: FreePolicy,
}

impl Default for HandleTableConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 128,
            max_handles: 1 << 20,
            free_policy: FreePolicy::default(),
        }
    }
}

/// Configuration for string marshaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringConfig {
    /// Cumulative bytes after which the decoder is replaced.
    pub decoder_byte_ceiling: u64,
}

impl Default for StringConfig {
    fn default() -> Self {
        Self {
            decoder_byte_ceiling: DEFAULT_DECODER_BYTE_CEILING,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.handles.initial_capacity, 128);
        assert_eq!(config.handles.max_handles, 1 << 20);
        assert_eq!(config.strings.decoder_byte_ceiling, DEFAULT_DECODER_BYTE_CEILING);
    }

    #[test]
    fn test_presets() {
        assert_eq!(BridgeConfig::strict().handles.free_policy, FreePolicy::Strict);
        assert_eq!(
            BridgeConfig::permissive().handles.free_policy,
            FreePolicy::Permissive
        );
    }

    #[test]
    fn test_partial_toml() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [handles]
            max_handles = 64
            free_policy = "permissive"
        "#,
        )
        .unwrap();

        assert_eq!(config.handles.max_handles, 64);
        assert_eq!(config.handles.initial_capacity, 128);
        assert_eq!(config.handles.free_policy, FreePolicy::Permissive);
        assert_eq!(config.strings, StringConfig::default());
    }
}
