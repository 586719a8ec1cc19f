pub mod exit;
pub mod launch;
pub mod lock;
pub mod run_loop;
