use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("missing or unresolvable hook addresses (send/recv/seed/checksum)")]
    IncompleteAddresses,
    #[error("page query failed for slot {slot:#x}")]
    PageQuery { slot: usize },
    #[error("could not grant write access to slot {slot:#x}")]
    Unprotect { slot: usize },
    #[error("timed out waiting for slot {slot:#x} to hold a patchable pointer")]
    PatchTimeout { slot: usize },
    #[error("slot patching requires a windows host")]
    Unsupported,
}
