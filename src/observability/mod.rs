pub mod logging;
pub mod metrics;

pub use logging::{init_logging, mask_key, LogFormat};
pub use metrics::init_metrics;
