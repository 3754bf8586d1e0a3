pub mod activity;
pub mod tracing_init;

pub use activity::Activity;
pub use tracing_init::init_tracing;
