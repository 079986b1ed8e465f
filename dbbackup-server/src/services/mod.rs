pub mod backup_scheduler;
pub mod config_sync;
pub mod disk;
pub mod dispatch;
pub mod packager;
pub mod pipeline;
pub mod retention;
pub mod storage;
pub mod workers;
