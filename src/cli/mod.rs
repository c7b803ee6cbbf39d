pub mod args;

pub use args::{parse, validate, Arguments, DebugLimits};
