use kernel_vmem::MapError;

/// Failures surfaced by the memory-management core.
///
/// Every variant is recoverable by the caller. The two conditions that are
/// not (handing out frame 0, exhaustion in a kernel address space) never
/// produce a value of this type; they go through [`fatal!`](crate::fatal).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of virtual address space")]
    OutOfVirtualSpace,
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("invalid range (misaligned, overlapping or unmatched address and size)")]
    InvalidRange,
    #[error("range is already reserved or in use")]
    DoubleReservation,
    #[error("permission denied")]
    PermissionDenied,
}

impl MemoryError {
    /// Resource exhaustion, as opposed to caller misuse.
    #[inline]
    #[must_use]
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, Self::OutOfVirtualSpace | Self::OutOfPhysicalMemory)
    }
}

impl From<MapError> for MemoryError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfTableFrames => Self::OutOfPhysicalMemory,
            MapError::AlreadyMapped(_) => Self::DoubleReservation,
            MapError::NotMapped(_) | MapError::HugePage(_) | MapError::Unaligned(_) => {
                Self::InvalidRange
            }
        }
    }
}

/// Log an unrecoverable invariant violation and halt via panic.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        panic!($($arg)+)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn map_errors_convert() {
        assert_eq!(
            MemoryError::from(MapError::OutOfTableFrames),
            MemoryError::OutOfPhysicalMemory
        );
        assert_eq!(
            MemoryError::from(MapError::NotMapped(VirtualAddress::new(0x1000))),
            MemoryError::InvalidRange
        );
    }

    #[test]
    fn exhaustion_classification() {
        assert!(MemoryError::OutOfVirtualSpace.is_exhaustion());
        assert!(MemoryError::OutOfPhysicalMemory.is_exhaustion());
        assert!(!MemoryError::InvalidRange.is_exhaustion());
        assert!(!MemoryError::PermissionDenied.is_exhaustion());
    }

    #[test]
    #[should_panic(expected = "frame 0")]
    fn fatal_panics_with_message() {
        fatal!("handed out frame {}", 0);
    }
}
