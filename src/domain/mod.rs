pub mod charger;
pub mod meter;
pub mod types;
pub mod vehicle;

pub use charger::*;
pub use meter::*;
pub use types::*;
pub use vehicle::*;
