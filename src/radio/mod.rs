pub mod designator;

pub use designator::Designator;
