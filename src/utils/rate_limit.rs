//! 令牌桶限速
//!
//! 桶初始是满的，按 `rate` 字节/秒持续补充，最多存 `capacity` 个令牌；
//! 每发出 N 字节消耗 N 个令牌，不够时等待。`rate <= 0` 或 `capacity <= 0` 时不限速。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use crate::core::{DispatchError, Result};

// 浮点误差容忍
const EPSILON: f64 = 1e-6;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// 尝试取走 `n` 个令牌，不够时返回需要等待的时长
    fn try_take(&mut self, n: f64) -> std::result::Result<(), Duration> {
        self.refill();

        if self.tokens + EPSILON >= n {
            self.tokens -= n;
            Ok(())
        } else {
            let seconds = (n - self.tokens) / self.rate;
            Err(Duration::from_secs_f64(seconds.max(0.0)))
        }
    }
}

/// 字节流限速器，clone 之后共享同一个桶
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Mutex<TokenBucket>>>,
    capacity: u64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: i64) -> Self {
        if !(rate > 0.0) || capacity <= 0 {
            return Self::unlimited();
        }

        Self {
            bucket: Some(Arc::new(Mutex::new(TokenBucket::new(rate, capacity as f64)))),
            capacity: capacity as u64,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            bucket: None,
            capacity: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// 单次最多能取的令牌数
    fn max_take(&self, wanted: u64) -> u64 {
        wanted.min(self.capacity).max(1)
    }

    fn try_take(&self, n: u64) -> std::result::Result<(), Duration> {
        match &self.bucket {
            None => Ok(()),
            Some(bucket) => {
                let mut guard = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.try_take(n as f64)
            }
        }
    }

    /// 等待直到取得 `n` 个令牌；等待过程可以被 `cancel` 打断
    pub async fn acquire(&self, n: u64, cancel: &CancellationToken) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut remaining = n;
        while remaining > 0 {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let take = self.max_take(remaining);
            match self.try_take(take) {
                Ok(()) => remaining -= take,
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// 给字节流加上限速
    pub fn throttle<S>(&self, inner: S, cancel: CancellationToken) -> Throttled<S> {
        Throttled {
            inner,
            limiter: self.clone(),
            pending: None,
            sleep: None,
            cancelled: Box::pin(cancel.cancelled_owned()),
            finished: false,
        }
    }
}

pin_project! {
    /// 限速后的字节流
    ///
    /// 大于桶容量的块会被拆开发送；取消后返回 `Interrupted` 错误并结束。
    pub struct Throttled<S> {
        #[pin]
        inner: S,
        limiter: RateLimiter,
        pending: Option<Bytes>,
        sleep: Option<Pin<Box<Sleep>>>,
        cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
        finished: bool,
    }
}

fn interrupted() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Interrupted, "transfer cancelled")
}

impl<S> Stream for Throttled<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.finished {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            *this.finished = true;
            this.pending.take();
            this.sleep.take();
            return Poll::Ready(Some(Err(interrupted())));
        }

        loop {
            if let Some(sleep) = this.sleep.as_mut() {
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                *this.sleep = None;
            }

            let Some(chunk) = this.pending.as_mut() else {
                match this.inner.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        if chunk.is_empty() || !this.limiter.is_enabled() {
                            return Poll::Ready(Some(Ok(chunk)));
                        }
                        *this.pending = Some(chunk);
                        continue;
                    }
                    other => return other,
                }
            };

            let take = this.limiter.max_take(chunk.len() as u64);
            match this.limiter.try_take(take) {
                Ok(()) => {
                    let part = chunk.split_to(take as usize);
                    if chunk.is_empty() {
                        *this.pending = None;
                    }
                    return Poll::Ready(Some(Ok(part)));
                }
                Err(wait) => {
                    *this.sleep = Some(Box::pin(tokio::time::sleep(wait)));
                }
            }
        }
    }
}
