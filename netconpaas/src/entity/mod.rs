pub mod role;
pub mod state;
