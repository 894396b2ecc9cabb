use std::fmt;
use std::str::FromStr;

/// How the SPI flash image is attached to the emulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAttachment {
    /// `-mtdblock <image>`
    MtdBlock,
    /// `-pflash <image>`
    PFlash,
}

impl FlashAttachment {
    pub fn flag(self) -> &'static str {
        match self {
            FlashAttachment::MtdBlock => "-mtdblock",
            FlashAttachment::PFlash => "-pflash",
        }
    }
}

/// Emulation parameters for one hardware variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSpec {
    pub machine: &'static str,
    pub cpu: &'static str,
    pub flash: FlashAttachment,
}

/// Supported hardware variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Aplite,
    Basalt,
    Chalk,
    Diorite,
    Emery,
    Flint,
    Gabbro,
}

/// Indexed by `Platform as usize`; order must follow the enum declaration.
const MACHINE_TABLE: [(&str, MachineSpec); 7] = [
    ("aplite", MachineSpec { machine: "pebble-bb2", cpu: "cortex-m3", flash: FlashAttachment::MtdBlock }),
    ("basalt", MachineSpec { machine: "pebble-snowy-bb", cpu: "cortex-m4", flash: FlashAttachment::PFlash }),
    ("chalk", MachineSpec { machine: "pebble-s4-bb", cpu: "cortex-m4", flash: FlashAttachment::PFlash }),
    ("diorite", MachineSpec { machine: "pebble-silk-bb", cpu: "cortex-m4", flash: FlashAttachment::MtdBlock }),
    ("emery", MachineSpec { machine: "pebble-snowy-emery-bb", cpu: "cortex-m4", flash: FlashAttachment::PFlash }),
    ("flint", MachineSpec { machine: "pebble-silk-bb", cpu: "cortex-m4", flash: FlashAttachment::MtdBlock }),
    ("gabbro", MachineSpec { machine: "pebble-spalding-gabbro-bb", cpu: "cortex-m4", flash: FlashAttachment::PFlash }),
];

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Aplite,
        Platform::Basalt,
        Platform::Chalk,
        Platform::Diorite,
        Platform::Emery,
        Platform::Flint,
        Platform::Gabbro,
    ];

    pub fn as_str(self) -> &'static str {
        MACHINE_TABLE[self as usize].0
    }

    /// Machine model, CPU model and flash attachment for this platform.
    pub fn machine(self) -> MachineSpec {
        MACHINE_TABLE[self as usize].1
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must not contain path separators")]
    PathSeparator { field: &'static str },
    #[error("{field} must not be a relative directory or contain NUL")]
    Reserved { field: &'static str },
    #[error("unknown platform: {0}")]
    Unknown(String),
}

/// Reject values that could escape the image root when joined into a path.
pub fn validate_path_component(field: &'static str, value: &str) -> Result<(), PlatformError> {
    if value.is_empty() {
        return Err(PlatformError::Empty { field });
    }
    if value.contains('/') || value.contains('\\') {
        return Err(PlatformError::PathSeparator { field });
    }
    if value == "." || value == ".." || value.contains('\0') {
        return Err(PlatformError::Reserved { field });
    }
    Ok(())
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_path_component("platform", s)?;
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PlatformError::Unknown(s.to_string()))
    }
}
