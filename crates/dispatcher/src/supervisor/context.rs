use futures::future::select_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use queen_core::models::{ERR_JOB_CANCELLED, ERR_PAUSE_JOB, ERR_QUOTA_EXCEEDED};
use queen_core::QueenError;

/// 取消原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// 外部取消了作业请求
    Cancelled,
    /// 收到暂停事件
    Paused,
    QuotaExceeded,
    /// 服务器正在关闭
    Shutdown,
}

impl CancelReason {
    pub fn error_code(&self) -> &'static str {
        match self {
            CancelReason::Cancelled | CancelReason::Shutdown => ERR_JOB_CANCELLED,
            CancelReason::Paused => ERR_PAUSE_JOB,
            CancelReason::QuotaExceeded => ERR_QUOTA_EXCEEDED,
        }
    }

    fn into_error(self) -> QueenError {
        match self {
            CancelReason::Cancelled => QueenError::Cancelled("作业已被取消".to_string()),
            CancelReason::Shutdown => QueenError::Cancelled("服务器正在关闭".to_string()),
            CancelReason::Paused => QueenError::execution(ERR_PAUSE_JOB, "作业已被暂停"),
            CancelReason::QuotaExceeded => QueenError::quota_exceeded("订阅配额超限，作业已被取消"),
        }
    }
}

/// 带截止时间和取消信号的执行上下文
///
/// 子上下文继承父上下文的取消信号和截止时间，取消子上下文不影响父上下文。
#[derive(Clone)]
pub struct ExecutionContext {
    deadline: Option<Instant>,
    cancel_tx: Arc<watch::Sender<Option<CancelReason>>>,
    /// 自身及所有祖先的取消信号
    signals: Vec<watch::Receiver<Option<CancelReason>>>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// 没有截止时间的根上下文
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(None);
        Self {
            deadline: None,
            cancel_tx: Arc::new(cancel_tx),
            signals: vec![cancel_rx],
        }
    }

    /// 创建子上下文，截止时间取父上下文与 `timeout` 中较早的一个
    pub fn child_with_timeout(&self, timeout: Option<Duration>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let own_deadline = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own_deadline) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        let mut signals = Vec::with_capacity(self.signals.len() + 1);
        signals.push(cancel_rx);
        signals.extend(self.signals.iter().cloned());
        Self {
            deadline,
            cancel_tx: Arc::new(cancel_tx),
            signals,
        }
    }

    /// 只有第一次取消生效
    pub fn cancel(&self, reason: CancelReason) {
        self.cancel_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.signals.iter().find_map(|rx| *rx.borrow())
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    pub fn is_done(&self) -> bool {
        self.cancel_reason().is_some() || self.deadline_exceeded()
    }

    /// 已结束时返回对应的错误
    pub fn error(&self) -> Option<QueenError> {
        if let Some(reason) = self.cancel_reason() {
            return Some(reason.into_error());
        }
        self.deadline_exceeded()
            .then(|| QueenError::Timeout("执行超过截止时间".to_string()))
    }

    /// 等待取消或截止时间到达
    pub async fn done(&self) -> QueenError {
        let waits = self.signals.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                loop {
                    let current = *rx.borrow_and_update();
                    if let Some(reason) = current {
                        return reason;
                    }
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            })
        });
        let cancelled = select_all(waits);
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            (reason, _, _) = cancelled => reason.into_error(),
            _ = expired => QueenError::Timeout("执行超过截止时间".to_string()),
        }
    }

    /// 运行future，上下文先结束时返回上下文的错误
    pub async fn run<T, F>(&self, future: F) -> Result<T, QueenError>
    where
        F: Future<Output = Result<T, QueenError>>,
    {
        if let Some(err) = self.error() {
            return Err(err);
        }
        tokio::select! {
            result = future => result,
            err = self.done() => Err(err),
        }
    }

    /// 可被取消的休眠
    pub async fn sleep(&self, duration: Duration) -> Result<(), QueenError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = ExecutionContext::new();
        let child = parent.child_with_timeout(None);
        let waiter = tokio::spawn({
            let child = child.clone();
            async move { child.done().await }
        });
        parent.cancel(CancelReason::Cancelled);
        let err = waiter.await.unwrap();
        assert!(matches!(err, QueenError::Cancelled(_)));
        assert_eq!(child.cancel_reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = ExecutionContext::new();
        let child = parent.child_with_timeout(None);
        child.cancel(CancelReason::Paused);
        assert!(child.is_done());
        assert!(!parent.is_done());
        assert_eq!(child.error().unwrap().error_code(), ERR_PAUSE_JOB);
    }

    #[tokio::test]
    async fn test_first_cancel_reason_wins() {
        let ctx = ExecutionContext::new();
        ctx.cancel(CancelReason::QuotaExceeded);
        ctx.cancel(CancelReason::Cancelled);
        assert_eq!(ctx.cancel_reason(), Some(CancelReason::QuotaExceeded));
        assert!(ctx.error().unwrap().is_quota_exceeded());
    }

    #[tokio::test]
    async fn test_deadline_interrupts_run() {
        let ctx = ExecutionContext::new().child_with_timeout(Some(Duration::from_millis(30)));
        let result: Result<(), QueenError> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(QueenError::Timeout(_))));
        assert!(ctx.deadline_exceeded());
    }

    #[tokio::test]
    async fn test_child_deadline_never_exceeds_parent() {
        let parent = ExecutionContext::new().child_with_timeout(Some(Duration::from_millis(20)));
        let child = parent.child_with_timeout(Some(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(child.is_done());
    }
}
