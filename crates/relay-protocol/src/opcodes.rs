/// Two-byte opcode (a, b), e.g. `C7 0A`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Opcode2 {
    pub a: u8,
    pub b: u8,
}

impl Opcode2 {
    /// Match against the first two bytes of a buffer.
    #[inline]
    pub const fn matches(self, buf: &[u8]) -> bool {
        buf.len() >= 2 && buf[0] == self.a && buf[1] == self.b
    }
}

/// Resets counter and seed state.
pub const C7_0A: Opcode2 = Opcode2 { a: 0xC7, b: 0x0A };
/// Drop handling on the receive side.
pub const C7_0B: Opcode2 = Opcode2 { a: 0xC7, b: 0x0B };
/// Resets counter and clears flags.
pub const B3_00: Opcode2 = Opcode2 { a: 0xB3, b: 0x00 };
/// Session/init boundary.
pub const OP_26_0C: Opcode2 = Opcode2 { a: 0x26, b: 0x0C };
/// Enables the seed/checksum transform for subsequent sends.
pub const MARKER_1C_0B: Opcode2 = Opcode2 { a: 0x1C, b: 0x0B };
