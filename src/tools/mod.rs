pub mod caption;
pub mod control;
pub mod enhance;
pub mod services;
pub mod translate;
