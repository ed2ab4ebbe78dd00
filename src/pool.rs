//! 書式化に使う一時領域のプール
//!
//! 取り出した領域は`Pooled`がドロップされたときに必ずプールへ戻る。
//! 早期リターンやエラーの経路でも同じ。

use std::{
    ops::{Deref, DerefMut},
    sync::{Mutex, PoisonError},
};

/// プールに戻す領域の最大容量（バイト）。これより大きい領域は捨てる。
const MAX_RETAINED_BYTES: usize = 16 << 10;

/// プールに保持しておく領域の最大数
const MAX_IDLE: usize = 64;

/// 出力行を組み立てるバッファ
pub(crate) static BUFFERS: Pool<Vec<u8>> = Pool::new();

/// グループ接頭語を組み立てる文字列
pub(crate) static PREFIXES: Pool<String> = Pool::new();

/// 属性書き換えフックに渡すグループ名のリスト
pub(crate) static GROUPS: Pool<Vec<String>> = Pool::new();

/// プールに入れられる一時領域
pub(crate) trait Scratch: Default {
    fn reset(&mut self);
    fn retained_bytes(&self) -> usize;
}

impl Scratch for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }

    fn retained_bytes(&self) -> usize {
        self.capacity()
    }
}

impl Scratch for String {
    fn reset(&mut self) {
        self.clear();
    }

    fn retained_bytes(&self) -> usize {
        self.capacity()
    }
}

impl Scratch for Vec<String> {
    fn reset(&mut self) {
        self.clear();
    }

    fn retained_bytes(&self) -> usize {
        self.capacity() * std::mem::size_of::<String>()
    }
}

pub(crate) struct Pool<T> {
    idle: Mutex<Vec<T>>,
}

impl<T: Scratch + 'static> Pool<T> {
    pub(crate) const fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// 空の領域を取り出す。プールが空なら新しく作成する。
    pub(crate) fn get(&'static self) -> Pooled<T> {
        let item = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        Pooled { pool: self, item }
    }

    fn put(&self, mut item: T) {
        if item.retained_bytes() > MAX_RETAINED_BYTES {
            return;
        }
        item.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(item);
        }
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// プールから取り出した領域。ドロップ時にプールへ戻る。
pub(crate) struct Pooled<T: Scratch + 'static> {
    pool: &'static Pool<T>,
    item: T,
}

impl<T: Scratch + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Scratch + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Scratch + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.item));
    }
}
