// =============================================================================
// Bounded collections
// =============================================================================
//
// Fixed-capacity building blocks used by the stores and the error monitor.
// All three containers guarantee their memory bound at every externally
// observable moment.

pub mod bit_set;
pub mod bounded_map;
pub mod circular_buffer;

pub use bit_set::BitSet;
pub use bounded_map::{BoundedMap, EvictionPolicy};
pub use circular_buffer::CircularBuffer;
