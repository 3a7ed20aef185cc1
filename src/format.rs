//! Wire-format version registry.

/// A versioned binary schema for sensor data. Determines both the
/// discovery group name a node joins and which formatter implementation
/// is selected for a given sensor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WireFormatVersion {
    V3,
    V4,
}

impl WireFormatVersion {
    /// All versions this crate understands, in ascending order.
    pub const fn supported_formats() -> &'static [WireFormatVersion] {
        &[WireFormatVersion::V3, WireFormatVersion::V4]
    }

    /// The highest-numbered supported version.
    pub fn latest() -> WireFormatVersion {
        *Self::supported_formats()
            .iter()
            .max_by_key(|f| f.version_major())
            .expect("supported_formats is never empty")
    }

    pub fn version_major(self) -> u32 {
        match self {
            WireFormatVersion::V3 => 3,
            WireFormatVersion::V4 => 4,
        }
    }
}

impl std::fmt::Display for WireFormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.version_major())
    }
}

/// The discovery-group identifier a node joins for a given wire format.
/// Two distinct versions always produce two distinct names.
pub fn group_name_from_format(version: WireFormatVersion) -> String {
    format!("pupil-mobile-v{}", version.version_major())
}
