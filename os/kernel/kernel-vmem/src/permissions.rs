use bitfield_struct::bitfield;

/// Access rights of a mapping, independent of any page-table format.
///
/// ```rust
/// # use kernel_vmem::Permissions;
/// let rw = Permissions::READ_WRITE;
/// assert!(rw.allows(Permissions::READ_ONLY));
/// assert!(!Permissions::READ_ONLY.allows(rw));
/// ```
#[bitfield(u8)]
#[derive(PartialEq, Eq, Hash)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Accessible from user mode.
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl Permissions {
    pub const NONE: Self = Self::new();
    pub const READ_ONLY: Self = Self::new().with_read(true);
    pub const READ_WRITE: Self = Self::new().with_read(true).with_write(true);
    pub const READ_EXECUTE: Self = Self::new().with_read(true).with_execute(true);

    /// Same rights, additionally user-accessible.
    #[inline]
    #[must_use]
    pub const fn for_user(self) -> Self {
        self.with_user(true)
    }

    /// Whether every right in `required` is granted by `self`.
    #[inline]
    #[must_use]
    pub const fn allows(self, required: Self) -> bool {
        self.into_bits() & required.into_bits() == required.into_bits()
    }
}
