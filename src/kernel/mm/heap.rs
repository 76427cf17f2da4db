// src/kernel/mm/heap.rs
//! カーネルヒープ
//!
//! 固定仮想領域 (既定 1 MiB) 上の first-fit ブロックアロケータ。
//! ブロックヘッダは {マジック, サイズ, 空きフラグ, next} の単方向リストで、
//! 解放時に直後ブロックが空きなら畳み込んで結合する。マジック不一致の
//! 解放は破損とみなして無視する（ベストエフォートで生き残る）。

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;

/// ヒープ破損検出用マジック
pub const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

/// 分割する価値のある最小の残りデータサイズ
const SPLIT_THRESHOLD: usize = 16;

/// 割り当て粒度 (4 バイト)
const ALIGN: usize = 4;

/// ヒープブロックヘッダ
#[repr(C)]
struct BlockHeader {
    magic: u32,
    size: u32,
    is_free: bool,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// first-fit ヒープ本体
pub struct KernelHeap {
    head: *mut BlockHeader,
    capacity: usize,
}

// SAFETY: 生ポインタはヒープ領域内のみを指し、外部とは LockedHeap の
// Mutex 越しにしか共有されない
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// 未初期化のヒープを作成
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            capacity: 0,
        }
    }

    /// 領域を 1 個の空きブロックとして初期化する
    ///
    /// # Safety
    ///
    /// `start` から `size` バイトが有効かつ排他的に使用可能で、4 バイト
    /// 境界に揃っていること。
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        debug_assert!(size > HEADER_SIZE);
        let head = start.cast::<BlockHeader>();
        // SAFETY: 呼び出し元が領域の有効性を保証している
        unsafe {
            head.write(BlockHeader {
                magic: HEAP_MAGIC,
                size: (size - HEADER_SIZE) as u32,
                is_free: true,
                next: ptr::null_mut(),
            });
        }
        self.head = head;
        self.capacity = size;
    }

    /// 初期化済みか
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.head.is_null()
    }

    /// first-fit でブロックを割り当てる
    ///
    /// サイズ 0 またはヒープ枯渇・破損検出時はヌルを返す。
    pub fn alloc_bytes(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.head.is_null() {
            return ptr::null_mut();
        }
        let size = (size + ALIGN - 1) & !(ALIGN - 1);

        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: current はリスト内の有効なヘッダ
            let block = unsafe { &mut *current };
            if block.magic != HEAP_MAGIC {
                // ヒープ破損
                return ptr::null_mut();
            }

            if block.is_free && block.size as usize >= size {
                // 残りが十分大きければ分割する
                if block.size as usize > size + HEADER_SIZE + SPLIT_THRESHOLD {
                    // SAFETY: ブロックのデータ域内に新ヘッダを置く
                    let new_block = unsafe {
                        current
                            .cast::<u8>()
                            .add(HEADER_SIZE + size)
                            .cast::<BlockHeader>()
                    };
                    // SAFETY: 上と同じ領域内
                    unsafe {
                        new_block.write(BlockHeader {
                            magic: HEAP_MAGIC,
                            size: block.size - (size + HEADER_SIZE) as u32,
                            is_free: true,
                            next: block.next,
                        });
                    }
                    block.size = size as u32;
                    block.next = new_block;
                }

                block.is_free = false;
                // SAFETY: ヘッダ直後がデータ域
                return unsafe { current.cast::<u8>().add(HEADER_SIZE) };
            }

            current = block.next;
        }

        ptr::null_mut()
    }

    /// アラインメント付き割り当て
    ///
    /// 余分に確保して返りアドレスを切り上げる。元のブロック先頭は失われる
    /// ため、この経路で得たポインタは `free_bytes` に渡せない。
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> *mut u8 {
        if align <= ALIGN {
            return self.alloc_bytes(size);
        }
        let raw = self.alloc_bytes(size + align);
        if raw.is_null() {
            return ptr::null_mut();
        }
        let addr = raw as usize;
        let aligned = (addr + align - 1) & !(align - 1);
        aligned as *mut u8
    }

    /// ブロックを解放する
    ///
    /// ヌルは無視。ヘッダマジックが合わない場合は破損とみなして無視する。
    /// 直後のブロックが空きなら結合する。
    pub fn free_bytes(&mut self, ptr_in: *mut u8) {
        if ptr_in.is_null() {
            return;
        }
        // SAFETY: alloc_bytes が返したポインタの直前にヘッダがある
        let header = unsafe { ptr_in.sub(HEADER_SIZE).cast::<BlockHeader>() };
        // SAFETY: 上で得たヘッダ位置
        let block = unsafe { &mut *header };
        if block.magic != HEAP_MAGIC {
            return;
        }

        block.is_free = true;

        if !block.next.is_null() {
            // SAFETY: next はリスト内の有効なヘッダ
            let next = unsafe { &mut *block.next };
            if next.magic == HEAP_MAGIC && next.is_free {
                block.size += HEADER_SIZE as u32 + next.size;
                block.next = next.next;
            }
        }
    }

    /// 使用中バイト数（ヘッダ込み）
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        let mut used = 0;
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: current はリスト内の有効なヘッダ
            let block = unsafe { &*current };
            if block.magic != HEAP_MAGIC {
                break;
            }
            if !block.is_free {
                used += HEADER_SIZE + block.size as usize;
            }
            current = block.next;
        }
        used
    }

    /// 空きバイト数
    #[must_use]
    pub fn free_bytes_total(&self) -> usize {
        let mut free = 0;
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: current はリスト内の有効なヘッダ
            let block = unsafe { &*current };
            if block.magic != HEAP_MAGIC {
                break;
            }
            if block.is_free {
                free += block.size as usize;
            }
            current = block.next;
        }
        free
    }

    /// ヒープ容量
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// グローバルアロケータとして登録できるロック付きヒープ
pub struct LockedHeap {
    inner: Mutex<KernelHeap>,
}

impl LockedHeap {
    /// 未初期化のヒープを作成
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(KernelHeap::empty()),
        }
    }

    /// ヒープ領域を初期化
    ///
    /// # Safety
    ///
    /// `KernelHeap::init` と同じ。
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        // SAFETY: 呼び出し元が領域の有効性を保証している
        unsafe {
            self.inner.lock().init(start, size);
        }
    }

    /// 使用中バイト数
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes()
    }

    /// first-fit 割り当て（`GlobalAlloc` を経由しない直接利用向け）
    pub fn alloc_bytes(&self, size: usize) -> *mut u8 {
        self.inner.lock().alloc_bytes(size)
    }

    /// ブロック解放（`GlobalAlloc` を経由しない直接利用向け）
    pub fn free_bytes(&self, ptr_in: *mut u8) {
        self.inner.lock().free_bytes(ptr_in);
    }
}

// SAFETY: 内部状態は Mutex で保護され、返すポインタはヒープ領域内で有効
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.inner.lock();
        if layout.align() <= ALIGN {
            heap.alloc_bytes(layout.size())
        } else {
            heap.alloc_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        if layout.align() <= ALIGN {
            self.inner.lock().free_bytes(ptr_in);
        }
        // アラインメント付き割り当ては元のブロック先頭が分からないため
        // 返却しない
    }
}

/// syscall 層から使う kmalloc 相当
pub fn kmalloc(size: usize) -> *mut u8 {
    #[cfg(all(target_arch = "x86", not(test)))]
    return crate::kernel_heap().alloc_bytes(size);
    #[cfg(not(all(target_arch = "x86", not(test))))]
    {
        let _ = size;
        return ptr::null_mut();
    }
}

/// syscall 層から使う kfree 相当
pub fn kfree(ptr_in: *mut u8) {
    #[cfg(all(target_arch = "x86", not(test)))]
    crate::kernel_heap().free_bytes(ptr_in);
    #[cfg(not(all(target_arch = "x86", not(test))))]
    let _ = ptr_in;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn arena(words: usize) -> (*mut u8, usize) {
        let buf = vec![0u64; words].leak();
        (buf.as_mut_ptr().cast::<u8>(), words * 8)
    }

    fn heap_with(bytes: usize) -> KernelHeap {
        let (start, size) = arena(bytes / 8);
        let mut heap = KernelHeap::empty();
        // SAFETY: リークした排他領域
        unsafe {
            heap.init(start, size);
        }
        heap
    }

    #[test]
    fn alloc_is_four_byte_aligned() {
        let mut heap = heap_with(4096);
        for size in [1usize, 3, 5, 17] {
            let p = heap.alloc_bytes(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % 4, 0);
        }
    }

    #[test]
    fn freed_block_is_reusable() {
        let mut heap = heap_with(4096);
        let a = heap.alloc_bytes(128);
        assert!(!a.is_null());
        heap.free_bytes(a);
        let b = heap.alloc_bytes(128);
        assert_eq!(a, b);
    }

    #[test]
    fn coalesce_with_successor() {
        // a, b, c を連続確保し b → a の順で解放すると a+b が結合され、
        // size(a) + size(b) + ヘッダ分の確保がヒープ拡張なしに成功する
        let mut heap = heap_with(4096);
        let a = heap.alloc_bytes(256);
        let b = heap.alloc_bytes(256);
        let c = heap.alloc_bytes(256);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        heap.free_bytes(b);
        heap.free_bytes(a);

        let merged = heap.alloc_bytes(256 + 256 + HEADER_SIZE);
        assert_eq!(merged, a);
        heap.free_bytes(merged);
        heap.free_bytes(c);
    }

    #[test]
    fn double_free_keeps_magic_guard() {
        let mut heap = heap_with(4096);
        let a = heap.alloc_bytes(64);
        let b = heap.alloc_bytes(64);
        heap.free_bytes(a);
        heap.free_bytes(a);
        // リストが壊れていなければ後続の確保・解放は成功する
        let c = heap.alloc_bytes(64);
        assert!(!c.is_null());
        heap.free_bytes(c);
        heap.free_bytes(b);
    }

    #[test]
    fn bad_magic_free_is_ignored() {
        let mut heap = heap_with(4096);
        let a = heap.alloc_bytes(64);
        let before = heap.used_bytes();
        // データ域の途中（ヘッダでない位置）を解放しても無視される
        // SAFETY: a はデータ域の先頭なので +8 も域内
        heap.free_bytes(unsafe { a.add(8) });
        assert_eq!(heap.used_bytes(), before);
        heap.free_bytes(a);
    }

    #[test]
    fn allocations_never_exceed_capacity() {
        let mut heap = heap_with(4096);
        let mut total = 0usize;
        let mut ptrs = vec![];
        loop {
            let p = heap.alloc_bytes(100);
            if p.is_null() {
                break;
            }
            total += 100;
            ptrs.push(p);
        }
        assert!(total <= heap.capacity());
        for p in ptrs {
            heap.free_bytes(p);
        }
    }

    #[test]
    fn aligned_alloc_rounds_up() {
        let mut heap = heap_with(8192);
        let p = heap.alloc_aligned(100, 64);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
    }

    #[test]
    fn zero_size_alloc_fails() {
        let mut heap = heap_with(4096);
        assert!(heap.alloc_bytes(0).is_null());
    }
}
