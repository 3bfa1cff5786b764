//! 编排服务器配置
//!
//! 配置按区块组织（common、topics、resources、queue、observability），
//! 每个区块都提供默认值和 `validate()`。加载顺序见 [`QueenConfig::load`]。

pub mod models;

pub use models::*;
