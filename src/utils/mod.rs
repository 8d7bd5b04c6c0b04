mod logging;
mod shutdown;

pub use logging::init_logging;
pub use shutdown::cancel_on_signal;
