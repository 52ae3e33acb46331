//! Error type for hook installation and removal

/// Error type for hook operations.
///
/// Every failure leaves the hook in a consistent state: the target bytes
/// are either fully original or fully patched, and the `installed` flag is
/// the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("hook is already installed")]
    AlreadyInstalled,

    #[error("hook is not installed")]
    AlreadyRemoved,

    #[error("target page is not executable")]
    NotExecutable,

    #[error("protection change on the target failed")]
    ProtectViolation,

    #[error("target prologue cannot hold a near jump")]
    NotEnoughSpace,

    #[error("target address is not set")]
    InvalidAddress,

    #[error("failed to snapshot bytes")]
    BackupCreating,

    #[error("failed to restore the original prologue")]
    BackupRestoring,

    #[error("failed to allocate the codecave")]
    AllocateCodecave,

    #[error("failed to release the codecave")]
    DeallocateCodecave,

    #[error("write to the target failed")]
    WriteMemory,

    #[error("failed to blank the codecave entry")]
    UsercodeJumpRemove,

    #[error("failed to restore the codecave entry")]
    ReinstallHook,
}
