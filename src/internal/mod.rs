//! Storage-format building blocks: the object model and the pack format.

pub mod object;
pub mod pack;
