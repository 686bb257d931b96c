pub mod board_config;
pub mod errors;
pub mod sync;
