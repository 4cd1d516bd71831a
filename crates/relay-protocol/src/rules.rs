use std::sync::atomic::Ordering;

use crate::{
    opcodes::{C7_0A, MARKER_1C_0B, OP_26_0C},
    scanner::ScanResult,
    state::ProtocolState,
};

/// Receive-side transitions. Any reset trigger (head `C7 0A`, head `B3 00`,
/// or inline `C7 0A`) clears the whole protocol state.
pub fn on_recv(scan: &ScanResult, state: &ProtocolState) {
    if scan.head_c70a || scan.head_b300 {
        state.reset_all();
        return;
    }
    if scan.off_c70a.is_some() {
        state.reset_all();
    }
}

/// Send-side transitions, driven by the first two bytes only.
pub fn on_send_head(head: &[u8], state: &ProtocolState) {
    if OP_26_0C.matches(head) || C7_0A.matches(head) {
        state.counter.store(0, Ordering::Relaxed);
        state.found_marker.store(false, Ordering::Relaxed);
        return;
    }
    if MARKER_1C_0B.matches(head) {
        state.found_marker.store(true, Ordering::Relaxed);
    }
}
