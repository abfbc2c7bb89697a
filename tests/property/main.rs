//! Property tests for buffer invariants and codec round-trips.
//!
//! Run with: `cargo test --test property`

mod input_buffer;
