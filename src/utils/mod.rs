pub mod cloud;
pub mod metrics;
