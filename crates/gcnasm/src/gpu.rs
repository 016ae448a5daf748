//! GCN device identification.

use std::{fmt, str::FromStr};

/// The GCN devices the toolchain knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuDeviceType {
    CapeVerde,
    Pitcairn,
    Tahiti,
    Oland,
    Bonaire,
    Spectre,
    Spooky,
    Kalindi,
    Hainan,
    Hawaii,
    Iceland,
    Tonga,
    Mullins,
    Fiji,
    Carrizo,
}

/// GCN generations, as far as instruction encodings are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcnArch {
    Gcn10,
    Gcn11,
    Gcn12,
}

impl GpuDeviceType {
    /// The spelling used by the `.gpu` directive.
    pub fn name(self) -> &'static str {
        match self {
            GpuDeviceType::CapeVerde => "CapeVerde",
            GpuDeviceType::Pitcairn => "Pitcairn",
            GpuDeviceType::Tahiti => "Tahiti",
            GpuDeviceType::Oland => "Oland",
            GpuDeviceType::Bonaire => "Bonaire",
            GpuDeviceType::Spectre => "Spectre",
            GpuDeviceType::Spooky => "Spooky",
            GpuDeviceType::Kalindi => "Kalindi",
            GpuDeviceType::Hainan => "Hainan",
            GpuDeviceType::Hawaii => "Hawaii",
            GpuDeviceType::Iceland => "Iceland",
            GpuDeviceType::Tonga => "Tonga",
            GpuDeviceType::Mullins => "Mullins",
            GpuDeviceType::Fiji => "Fiji",
            GpuDeviceType::Carrizo => "Carrizo",
        }
    }

    pub fn arch(self) -> GcnArch {
        match self {
            GpuDeviceType::CapeVerde
            | GpuDeviceType::Pitcairn
            | GpuDeviceType::Tahiti
            | GpuDeviceType::Oland
            | GpuDeviceType::Hainan => GcnArch::Gcn10,
            GpuDeviceType::Bonaire
            | GpuDeviceType::Spectre
            | GpuDeviceType::Spooky
            | GpuDeviceType::Kalindi
            | GpuDeviceType::Hawaii
            | GpuDeviceType::Mullins => GcnArch::Gcn11,
            GpuDeviceType::Iceland
            | GpuDeviceType::Tonga
            | GpuDeviceType::Fiji
            | GpuDeviceType::Carrizo => GcnArch::Gcn12,
        }
    }

    pub const ALL: &'static [GpuDeviceType] = &[
        GpuDeviceType::CapeVerde,
        GpuDeviceType::Pitcairn,
        GpuDeviceType::Tahiti,
        GpuDeviceType::Oland,
        GpuDeviceType::Bonaire,
        GpuDeviceType::Spectre,
        GpuDeviceType::Spooky,
        GpuDeviceType::Kalindi,
        GpuDeviceType::Hainan,
        GpuDeviceType::Hawaii,
        GpuDeviceType::Iceland,
        GpuDeviceType::Tonga,
        GpuDeviceType::Mullins,
        GpuDeviceType::Fiji,
        GpuDeviceType::Carrizo,
    ];
}

impl fmt::Display for GpuDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown GPU device type \"{0}\"")]
pub struct UnknownGpuDevice(pub String);

impl FromStr for GpuDeviceType {
    type Err = UnknownGpuDevice;

    fn from_str(s: &str) -> Result<GpuDeviceType, UnknownGpuDevice> {
        GpuDeviceType::ALL
            .iter()
            .copied()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownGpuDevice(s.to_owned()))
    }
}
