pub mod bluetooth;
pub mod device_log;
pub mod logging;
