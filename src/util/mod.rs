pub mod log_throttle;
