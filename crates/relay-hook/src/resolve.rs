//! Hex address parsing and absolute-or-module-relative resolution.

use tracing::debug;

/// The four addresses the hook needs: two slots and two leaf routines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub send_slot: usize,
    pub recv_slot: usize,
    pub seed_fn: usize,
    pub checksum_fn: usize,
}

impl ResolvedAddrs {
    pub fn complete(&self) -> bool {
        self.send_slot != 0 && self.recv_slot != 0 && self.seed_fn != 0 && self.checksum_fn != 0
    }
}

/// Parse a hex address with or without a `0x` prefix. Empty or garbage input
/// parses to 0, which the install path treats as a configuration error.
pub fn parse_hex_addr(hex: &str) -> usize {
    let trimmed = hex.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    usize::from_str_radix(digits, 16).unwrap_or(0)
}

/// Accept an absolute address if its page is committed; otherwise try it as
/// an offset from the host module's load base; otherwise hand it back
/// unchanged.
#[cfg(windows)]
fn ensure_absolute_or_offset(addr: usize) -> usize {
    use winapi::um::libloaderapi::GetModuleHandleW;

    use crate::mem::is_committed;

    if addr == 0 {
        return 0;
    }
    if is_committed(addr) {
        return addr;
    }
    let base = unsafe { GetModuleHandleW(std::ptr::null()) } as usize;
    let candidate = base.wrapping_add(addr);
    if is_committed(candidate) {
        return candidate;
    }
    addr
}

#[cfg(not(windows))]
fn ensure_absolute_or_offset(addr: usize) -> usize {
    addr
}

pub fn resolve(send: &str, recv: &str, seed: &str, checksum: &str) -> ResolvedAddrs {
    let out = ResolvedAddrs {
        send_slot: ensure_absolute_or_offset(parse_hex_addr(send)),
        recv_slot: ensure_absolute_or_offset(parse_hex_addr(recv)),
        seed_fn: ensure_absolute_or_offset(parse_hex_addr(seed)),
        checksum_fn: ensure_absolute_or_offset(parse_hex_addr(checksum)),
    };
    log_pages(&out);
    out
}

/// Page state/protection diagnostics for each resolved address.
#[cfg(windows)]
fn log_pages(addrs: &ResolvedAddrs) {
    use crate::mem::{protect_name, query, state_name};

    let log_one = |name: &str, addr: usize| {
        if addr == 0 {
            return;
        }
        if let Some(mbi) = query(addr) {
            debug!(
                addr = format_args!("{addr:#x}"),
                state = state_name(mbi.State),
                protect = protect_name(mbi.Protect),
                "resolved {name}"
            );
        }
    };
    log_one("send_slot", addrs.send_slot);
    log_one("recv_slot", addrs.recv_slot);
    log_one("seed_fn", addrs.seed_fn);
    log_one("checksum_fn", addrs.checksum_fn);
}

#[cfg(not(windows))]
fn log_pages(addrs: &ResolvedAddrs) {
    debug!(?addrs, "resolved addresses (no page info off-windows)");
}
