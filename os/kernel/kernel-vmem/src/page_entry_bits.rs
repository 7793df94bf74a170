use crate::Permissions;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// The same layout serves all four levels (PML4E, PDPTE, PDE, PTE); only
/// 4 KiB leaves and non-leaf table pointers are produced by this crate, so
/// `large_page` is always clear in entries we write.
///
/// ### Bit layout (canonical)
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–62     | OS avail high     | Reserved for OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::{PageEntryBits, Permissions};
/// let e = PageEntryBits::leaf(PhysicalAddress::new(0x5000), Permissions::READ_WRITE);
/// assert!(e.present());
/// assert!(e.writable());
/// assert!(e.no_execute());
/// assert_eq!(e.physical_address().as_u64(), 0x5000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Set in a PDPTE/PDE when the entry is a 1 GiB / 2 MiB leaf. We never
    /// create such entries; walks treat them as foreign.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global_translation: bool,

    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    #[bits(11)]
    pub os_available_high: u16,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Non-leaf entry pointing at the next-level table in `table`.
    ///
    /// Non-leaf entries are fully permissive; x86 intersects rights along the
    /// walk, so the leaf alone decides. `user` must be set for any table that
    /// leads to user-accessible leaves.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalAddress, user: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        e.set_physical_address(table);
        e
    }

    /// 4 KiB leaf mapping `frame` with `permissions`.
    ///
    /// Read access is implied by presence; a missing `execute` right sets NX.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, permissions: Permissions) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(permissions.write())
            .with_user_access(permissions.user())
            .with_no_execute(!permissions.execute());
        e.set_physical_address(frame);
        e
    }

    /// Keep the frame, replace the access bits.
    #[inline]
    #[must_use]
    pub const fn with_permissions(self, permissions: Permissions) -> Self {
        self.with_writable(permissions.write())
            .with_user_access(permissions.user())
            .with_no_execute(!permissions.execute())
    }

    /// Rights this entry grants, as seen by the core.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Permissions {
        Permissions::new()
            .with_read(self.present())
            .with_write(self.writable())
            .with_execute(!self.no_execute())
            .with_user(self.user_access())
    }
}
