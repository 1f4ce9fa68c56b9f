pub mod events;
pub mod frontier;
pub mod source;
pub mod writer;
