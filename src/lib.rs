pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod test_util;
pub mod util;
