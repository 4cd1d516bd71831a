//! Wait-for-non-null slot patching with verification, and unconditional
//! forced writes for the watchdog and uninstall.

use std::{ffi::c_void, thread, time::Duration};

use tracing::{debug, error};

use crate::{
    error::HookError,
    mem::{PageGuard, query, read_slot, writable_protection, write_slot},
};

pub const WAIT_TOTAL: Duration = Duration::from_secs(60);
pub const WAIT_STEP: Duration = Duration::from_millis(50);

/// Poll `slot` until it holds a non-null pointer, then capture that value,
/// write `replacement` and verify by re-reading. The loader may rewrite the
/// slot during startup, so a failed verification retries until the budget is
/// spent.
pub fn wait_and_patch(
    slot: usize,
    replacement: usize,
    total: Duration,
    step: Duration,
) -> Result<usize, HookError> {
    if slot == 0 || replacement == 0 {
        return Err(HookError::IncompleteAddresses);
    }

    let tries = if step.is_zero() {
        0
    } else {
        (total.as_millis() / step.as_millis().max(1)) as u64
    };

    for i in 0..=tries {
        let Some(mbi) = query(slot) else {
            error!(slot = format_args!("{slot:#x}"), "page query failed for slot");
            return Err(HookError::PageQuery { slot });
        };

        let current = unsafe { read_slot(slot) };
        if current != 0 {
            let guard = PageGuard::new(
                mbi.BaseAddress as *mut c_void,
                mbi.RegionSize,
                writable_protection(mbi.Protect),
            );
            if !guard.ok() {
                error!(slot = format_args!("{slot:#x}"), "could not make slot writable");
                return Err(HookError::Unprotect { slot });
            }

            unsafe { write_slot(slot, replacement) };

            if unsafe { read_slot(slot) } == replacement {
                debug!(
                    slot = format_args!("{slot:#x}"),
                    original = format_args!("{current:#x}"),
                    replacement = format_args!("{replacement:#x}"),
                    "patched slot"
                );
                return Ok(current);
            }
            // Someone flipped it right back, keep trying.
        }

        if !step.is_zero() && i < tries {
            thread::sleep(step);
        }
    }

    error!(slot = format_args!("{slot:#x}"), "timeout waiting for slot to become patchable");
    Err(HookError::PatchTimeout { slot })
}

/// Unconditional guarded write, best effort.
pub fn force(slot: usize, value: usize) {
    if slot == 0 || value == 0 {
        return;
    }
    let Some(mbi) = query(slot) else { return };
    let guard = PageGuard::new(
        mbi.BaseAddress as *mut c_void,
        mbi.RegionSize,
        writable_protection(mbi.Protect),
    );
    if !guard.ok() {
        return;
    }
    unsafe { write_slot(slot, value) };
}
