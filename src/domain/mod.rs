pub mod billing;
pub mod framing;
pub mod models;
pub mod occupancy;
pub mod protocol;
