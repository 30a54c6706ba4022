pub mod shutdown;
pub mod time;
