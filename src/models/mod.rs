pub mod assignment;
pub mod suborder;
pub mod token;
pub mod unit;
