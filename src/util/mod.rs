pub mod chain;
pub mod hint;
pub mod num;
