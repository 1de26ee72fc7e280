mod generate;
mod health;
mod metrics;
mod stop;

pub use generate::generate_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use stop::stop_handler;
