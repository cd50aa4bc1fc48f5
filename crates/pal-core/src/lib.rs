pub mod classify;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod prompt;
pub mod protocol;
pub mod stream;
