//! 回调闸门
//!
//! 回调在读锁内执行，`close` 取写锁，
//! 所以 `close` 返回时不存在执行中的回调，之后也不会再有。
//! 回调里不能关闭同一个闸门。

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub(crate) struct CallbackGate {
    closed: RwLock<bool>,
}

impl CallbackGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 闸门打开时执行 `f`，返回是否执行了
    pub(crate) fn run<F: FnOnce()>(&self, f: F) -> bool {
        let closed = self.closed.read();
        if *closed {
            return false;
        }
        f();
        true
    }

    /// 关闭闸门（幂等），等待执行中的回调结束
    pub(crate) fn close(&self) {
        *self.closed.write() = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.read()
    }
}
