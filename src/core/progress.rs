use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;

/// 单次上传的进度事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// 创建一对进度发送/接收端
///
/// 接收端得到的是有限序列：流读完、出错或被丢弃（取消）后发送端随之释放，
/// 接收端读到 `None` 即结束。
pub fn progress_channel() -> (mpsc::UnboundedSender<ProgressEvent>, ProgressReceiver) {
    mpsc::unbounded_channel()
}

pin_project! {
    /// 包装文件流，每读出一块就产生一个进度事件
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        bytes_sent: u64,
        total_bytes: u64,
        progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total_bytes: u64, progress_tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            total_bytes,
            progress_tx,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.bytes_sent += chunk.len() as u64;
                    // 接收端已经不在时忽略
                    let _ = this.progress_tx.send(ProgressEvent {
                        bytes_sent: *this.bytes_sent,
                        total_bytes: *this.total_bytes,
                    });
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
