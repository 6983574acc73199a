mod types;

pub use types::{Result, StackError};
