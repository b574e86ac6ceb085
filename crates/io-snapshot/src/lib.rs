//! Versioned, tagged snapshot encoding for emulated device state.
//!
//! Devices serialize into a self-describing TLV stream: a fixed header
//! (magic, 4-byte device id, major/minor version) followed by tagged fields.
//! Readers skip unknown tags, so a newer writer stays loadable by an older
//! reader as long as the major version matches.

pub mod state;
