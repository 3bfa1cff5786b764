//! 编排引擎的核心类型：错误、数据模型、配置以及外部协作者接口。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use errors::*;
