pub mod app;
pub mod device;
