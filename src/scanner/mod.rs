//! Incremental scanners that cut complete JSON objects out of a growing text buffer.
//!
//! Both scanners are plain structs fed one delta at a time; they never emit a
//! partially received object.

pub mod array;
pub mod line;

pub use array::ArrayScanner;
pub use line::LineScanner;
