// src/kernel/mm/test_support.rs
//! ホストテスト用の物理メモリアリーナ
//!
//! 物理ウィンドウはプロセス全体で 1 つなので、リークした単一アリーナを
//! 全テストで共有し、テストごとに互いに素なフレーム範囲を切り出す。

use super::frame::{FrameAllocator, FRAME_ALLOCATOR};
use super::types::{set_phys_window, PhysAddr};
use super::PAGE_SIZE;
use alloc::vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

/// アリーナの総フレーム数 (16 MiB)
const ARENA_FRAMES: usize = 4096;

static WINDOW: Once<usize> = Once::new();
// オフセット 0 は配らない (PhysAddr 0 は番兵)
static NEXT: AtomicUsize = AtomicUsize::new(PAGE_SIZE);

fn ensure_window() {
    WINDOW.call_once(|| {
        let buf = vec![0u64; ARENA_FRAMES * PAGE_SIZE / 8].leak();
        let base = buf.as_mut_ptr() as usize;
        set_phys_window(base);
        base
    });
}

/// アリーナから切り出した範囲を管理するフレームアロケータを作る
pub fn phys_arena(frames: usize) -> FrameAllocator {
    ensure_window();
    let bytes = frames * PAGE_SIZE;
    let offset = NEXT.fetch_add(bytes, Ordering::SeqCst);
    assert!(
        offset + bytes <= ARENA_FRAMES * PAGE_SIZE,
        "test arena exhausted"
    );
    let mut allocator = FrameAllocator::new();
    allocator.init(PhysAddr::new(offset as u32), frames, 0);
    allocator
}

/// グローバルのフレームアロケータをアリーナの切り出しで初期化する
///
/// プロセス・syscall 層のテストは `FRAME_ALLOCATOR` を暗黙に使うため、
/// そちらのセットアップはこれを通す。
pub fn init_global_frames(frames: usize) {
    ensure_window();
    let bytes = frames * PAGE_SIZE;
    let offset = NEXT.fetch_add(bytes, Ordering::SeqCst);
    assert!(
        offset + bytes <= ARENA_FRAMES * PAGE_SIZE,
        "test arena exhausted"
    );
    FRAME_ALLOCATOR
        .lock()
        .init(PhysAddr::new(offset as u32), frames, 0);
}
