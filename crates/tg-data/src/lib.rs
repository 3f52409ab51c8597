mod fsio;

pub mod bundle;
pub mod features;
pub mod remote;
pub mod settings;
pub mod tracking;

pub use bundle::*;
pub use features::*;
pub use remote::*;
pub use settings::*;
pub use tracking::*;
