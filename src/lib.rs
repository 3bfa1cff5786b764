//! Queen编排服务器的进程组装：应用生命周期与优雅关闭。

pub mod app;
pub mod shutdown;
