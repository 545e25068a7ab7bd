/// Width of a node identifier in bytes (SHA-1 output size).
pub const ID_LEN: usize = 20;

/// Width of a node identifier in bits.
pub const ID_LEN_BITS: usize = ID_LEN * 8;
