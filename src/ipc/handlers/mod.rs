pub mod attendance;
pub mod bundle;
pub mod core;
pub mod fees;
pub mod reports;
pub mod roster;
pub mod staff;
