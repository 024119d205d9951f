pub mod api;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod demux;
pub mod dispatch;
pub mod error;
pub mod logs;
pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
