// src/kernel/mm/mod.rs
//! メモリ管理
//!
//! 物理フレームアロケータ、2 段ページテーブルの仮想メモリ管理、
//! カーネルヒープを提供します。
//!
//! 初期化順序には制約があります。フレームアロケータはページング有効化
//! より前に使える必要があり（最初のページテーブルフレームはここから
//! 出る）、ヒープはアイデンティティマップ領域内に置かれるため、
//! ページング前後どちらでも同じアドレスで動きます。

pub mod frame;
pub mod heap;
pub mod paging;
#[cfg(test)]
pub mod test_support;
pub mod types;

pub use frame::{FrameAllocator, FRAME_ALLOCATOR};
pub use paging::{AddressSpace, PageFlags};
pub use types::{PhysAddr, VirtAddr};

/// ページサイズ (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// ユーザー空間の先頭仮想アドレス（上位 2 GiB がユーザー領域）
pub const USER_BASE: u32 = 0x8000_0000;

/// 実行ファイルをロードするユーザー領域内の既定ベース
pub const USER_LOAD_BASE: u32 = 0x8004_8000;

/// ユーザースタックの上端
pub const USER_STACK_TOP: u32 = 0xFFFF_0000;

/// ユーザースタックのページ数 (64 KiB)
pub const USER_STACK_PAGES: usize = 16;

/// カーネルヒープの容量 (1 MiB)
pub const HEAP_SIZE: usize = 1024 * 1024;

/// アドレスがユーザー領域か
#[inline]
#[must_use]
pub const fn is_user_address(addr: u32) -> bool {
    addr >= USER_BASE
}
