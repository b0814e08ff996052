pub mod artifact;
pub mod derived;
pub mod hasher;

pub use artifact::*;
pub use derived::*;
