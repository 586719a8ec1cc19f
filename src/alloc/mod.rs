pub mod bitvec;
pub mod core_alloc;
pub mod dlc;
pub mod heap;
pub mod tracker;
