//! Packed partition state word.
//!
//! Layout of the 64-bit word:
//!
//! | bits  | field        |
//! |-------|--------------|
//! | 0-2   | state ordinal|
//! | 16-31 | reservations |
//! | 32-63 | size (i32)   |
//!
//! Keeping the three fields in one word lets a single compare-and-swap move
//! state, reservation count and size together.

use partex_core::PartitionState;

const STATE_MASK: u64 = 0x0000_0000_0000_0007;
const RESERVATIONS_MASK: u64 = 0x0000_0000_FFFF_0000;
const SIZE_MASK: u64 = 0xFFFF_FFFF_0000_0000;

const RESERVATIONS_SHIFT: u32 = 16;
const SIZE_SHIFT: u32 = 32;

/// Largest reservation count the word can hold.
pub const MAX_RESERVATIONS: u32 = 0xFFFF;

/// Copyable view over a packed state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedState(u64);

impl PackedState {
    /// Word for a fresh partition: given state, no reservations, empty.
    #[must_use]
    pub const fn initial(state: PartitionState) -> Self {
        Self(state as u64)
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn state(self) -> PartitionState {
        // Only valid ordinals are ever written through `with_state`.
        #[allow(clippy::cast_possible_truncation)]
        let ordinal = (self.0 & STATE_MASK) as u8;
        PartitionState::from_ordinal(ordinal).unwrap_or(PartitionState::Lost)
    }

    #[must_use]
    pub fn reservations(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let r = ((self.0 & RESERVATIONS_MASK) >> RESERVATIONS_SHIFT) as u32;
        r
    }

    #[must_use]
    pub fn size(self) -> i32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let s = ((self.0 & SIZE_MASK) >> SIZE_SHIFT) as u32 as i32;
        s
    }

    #[must_use]
    pub fn with_state(self, state: PartitionState) -> Self {
        Self((self.0 & !STATE_MASK) | u64::from(state.ordinal()))
    }

    /// Replaces the reservation count; values above [`MAX_RESERVATIONS`] are masked.
    #[must_use]
    pub fn with_reservations(self, reservations: u32) -> Self {
        debug_assert!(reservations <= MAX_RESERVATIONS);
        let r = (u64::from(reservations) << RESERVATIONS_SHIFT) & RESERVATIONS_MASK;
        Self((self.0 & !RESERVATIONS_MASK) | r)
    }

    #[must_use]
    pub fn with_size(self, size: i32) -> Self {
        #[allow(clippy::cast_sign_loss)]
        let s = u64::from(size as u32) << SIZE_SHIFT;
        Self((self.0 & !SIZE_MASK) | s)
    }
}
