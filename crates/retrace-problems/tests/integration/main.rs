// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod clustering;
pub mod coredump;
pub mod kerneloops;
pub mod reports;
pub mod utils;

pub use utils::*;
