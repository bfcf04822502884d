pub mod metrics;
pub mod safe_print;
pub mod trace;
