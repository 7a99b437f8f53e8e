//! Monitor channel opcodes.
//!
//! The monitor protocol multiplexes over the admin socket: its opcodes are
//! disjoint from the admin set and its messages are decoded by the same
//! admin codec (see [`crate::admin`]), but they form their own logical
//! channel with per-subscriber state.

pub mod op {
    pub const GET_ENTRIES_REQ: u8 = 0x30;
    pub const GET_FLUSH_REQ: u8 = 0x31;
    pub const GET_ENTRIES_RESP: u8 = 0xB0;
}
