pub mod diff;
pub mod encoders;
pub mod errors;
pub mod params;
pub mod performance;
pub mod run;

pub use diff::*;
pub use encoders::*;
pub use errors::*;
pub use params::*;
pub use performance::*;
pub use run::*;
