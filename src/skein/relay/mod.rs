pub mod dialer;
pub mod frame;
pub mod lifecycle;
pub mod session;
pub mod table;
