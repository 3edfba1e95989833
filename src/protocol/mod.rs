//! 协议层模块 (redis 风格行/批量帧)

pub mod resp;
