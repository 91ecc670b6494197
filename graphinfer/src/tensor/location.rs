/// Execution provider identity.
///
/// Providers are identified by a static name, matching the string-typed
/// provider ids the session registry is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(pub &'static str);

/// Default CPU execution provider id.
pub const CPU_PROVIDER: ProviderId = ProviderId("cpu");

impl Default for ProviderId {
    fn default() -> Self {
        CPU_PROVIDER
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory classification within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemType {
    #[default]
    Default,
    Output,
}

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryInfo {
    pub provider: ProviderId,
    pub device_id: i32,
    pub mem_type: MemType,
}

impl MemoryInfo {
    pub fn cpu_default() -> Self {
        MemoryInfo {
            provider: CPU_PROVIDER,
            device_id: 0,
            mem_type: MemType::Default,
        }
    }

    pub fn cpu_output() -> Self {
        MemoryInfo {
            provider: CPU_PROVIDER,
            device_id: 0,
            mem_type: MemType::Output,
        }
    }

    /// Device key ignoring the memory classification.
    pub fn device_key(&self) -> (ProviderId, i32) {
        (self.provider, self.device_id)
    }
}
