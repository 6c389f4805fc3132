//! Live notification fan-out.

pub mod bus;
