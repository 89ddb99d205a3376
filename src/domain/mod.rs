pub mod command_payload;
pub mod heartbeat;
pub mod models;
pub mod session_state;
