//! # Emulator Configuration
//!
//! Tunables for the execution core, resolved once at emulator creation.
//! Values come from the builder or from `SIMT_*` environment variables;
//! invalid combinations are rejected up front so the hot path never
//! re-validates.

use crate::error::{EmuError, Result};

/// Execution-model tunables.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Number of work-items per wavefront. Must be a power of two.
    pub wavefront_size: u32,
    /// Emit a trace event for every instruction retired by lane zero of
    /// every wavefront.
    pub trace_lane_zero: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            wavefront_size: 64,
            trace_lane_zero: false,
        }
    }
}

/// Memory-system tunables.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of the flat guest memory, in bytes.
    pub flat_memory_limit: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            // 256 MiB, enough headroom for every regression kernel while
            // keeping a runaway guest allocation bounded.
            flat_memory_limit: 256 * 1024 * 1024,
        }
    }
}

/// Complete emulator configuration.
#[derive(Debug, Clone, Default)]
pub struct EmuConfig {
    /// Execution-model tunables.
    pub execution: ExecutionConfig,
    /// Memory-system tunables.
    pub memory: MemoryConfig,
}

impl EmuConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> EmuConfigBuilder {
        EmuConfigBuilder::default()
    }

    /// Build a configuration from the environment.
    ///
    /// Recognized variables: `SIMT_WAVEFRONT_SIZE`, `SIMT_FLAT_MEMORY_LIMIT`
    /// and `SIMT_TRACE_LANE_ZERO`. Unset variables keep their defaults;
    /// unparsable values are an [`EmuError::InvalidConfig`].
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Ok(raw) = std::env::var("SIMT_WAVEFRONT_SIZE") {
            let size = raw.parse::<u32>().map_err(|_| {
                EmuError::InvalidConfig(format!("SIMT_WAVEFRONT_SIZE: `{raw}` is not a number"))
            })?;
            builder = builder.wavefront_size(size);
        }
        if let Ok(raw) = std::env::var("SIMT_FLAT_MEMORY_LIMIT") {
            let limit = raw.parse::<u32>().map_err(|_| {
                EmuError::InvalidConfig(format!("SIMT_FLAT_MEMORY_LIMIT: `{raw}` is not a number"))
            })?;
            builder = builder.flat_memory_limit(limit);
        }
        if let Ok(raw) = std::env::var("SIMT_TRACE_LANE_ZERO") {
            builder = builder.trace_lane_zero(raw == "1" || raw.eq_ignore_ascii_case("true"));
        }
        builder.build()
    }

    /// Check invariants the rest of the core relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.execution.wavefront_size.is_power_of_two() {
            return Err(EmuError::InvalidConfig(format!(
                "wavefront size {} is not a power of two",
                self.execution.wavefront_size
            )));
        }
        if self.memory.flat_memory_limit < 4096 {
            return Err(EmuError::InvalidConfig(format!(
                "flat memory limit {} is below the 4 KiB minimum",
                self.memory.flat_memory_limit
            )));
        }
        Ok(())
    }
}

/// Builder for [`EmuConfig`].
#[derive(Debug, Default)]
pub struct EmuConfigBuilder {
    config: EmuConfig,
}

impl EmuConfigBuilder {
    /// Set the wavefront size.
    pub fn wavefront_size(mut self, size: u32) -> Self {
        self.config.execution.wavefront_size = size;
        self
    }

    /// Enable or disable lane-zero instruction tracing.
    pub fn trace_lane_zero(mut self, enabled: bool) -> Self {
        self.config.execution.trace_lane_zero = enabled;
        self
    }

    /// Set the flat-memory capacity limit.
    pub fn flat_memory_limit(mut self, limit: u32) -> Self {
        self.config.memory.flat_memory_limit = limit;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<EmuConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EmuConfig::default();
        config.validate().unwrap();
        assert_eq!(config.execution.wavefront_size, 64);
    }

    #[test]
    fn test_builder_overrides() {
        let config = EmuConfig::builder()
            .wavefront_size(4)
            .flat_memory_limit(1 << 20)
            .trace_lane_zero(true)
            .build()
            .unwrap();
        assert_eq!(config.execution.wavefront_size, 4);
        assert_eq!(config.memory.flat_memory_limit, 1 << 20);
        assert!(config.execution.trace_lane_zero);
    }

    #[test]
    fn test_invalid_wavefront_size_rejected() {
        let err = EmuConfig::builder().wavefront_size(48).build().unwrap_err();
        assert!(matches!(err, EmuError::InvalidConfig(_)));
    }

    #[test]
    fn test_tiny_memory_limit_rejected() {
        let err = EmuConfig::builder()
            .flat_memory_limit(1024)
            .build()
            .unwrap_err();
        assert!(matches!(err, EmuError::InvalidConfig(_)));
    }
}
