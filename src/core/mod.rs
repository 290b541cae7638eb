// Core modules implementing staging, engine invocation, normalization, and pipe coordination.
pub mod cancel;
pub mod engine;
pub mod error;
pub mod float;
pub mod normalize;
pub mod pipeline;
pub mod staging;
pub mod writer;
