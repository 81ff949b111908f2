pub mod backend;
pub mod diff;
pub mod elevation;
pub mod executor;
pub mod listing;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod status;
pub mod translator;

pub use backend::*;
pub use diff::*;
pub use executor::*;
pub use listing::*;
pub use status::*;
pub use translator::*;
