use std::fmt::Write;

/// Bounded hex preview for log lines: up to `max` bytes as `XX XX ..`,
/// with the total length appended when truncated.
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    let take = bytes.len().min(max);
    let mut out = String::with_capacity(take * 3 + 12);
    for (i, b) in bytes[..take].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02X}");
    }
    if take < bytes.len() {
        let _ = write!(out, " ..({})", bytes.len());
    }
    out
}
