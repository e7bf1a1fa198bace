//! Process exit codes.
//!
//! Code 2 is left to clap for usage errors.

pub const SUCCESS: u8 = 0;
pub const GENERAL_ERROR: u8 = 1;
pub const CONFIG_INVALID: u8 = 3;
pub const NOT_FOUND: u8 = 4;
pub const PERMISSION_DENIED: u8 = 5;
pub const ADDRESS_IN_USE: u8 = 6;
pub const CANCELLED: u8 = 130;
