// src/lib.rs
//! ember OS - a small 32-bit x86 kernel
//!
//! Trap plane, two-level paging, a mount-aware VFS over a CPIO initrd,
//! and a round-robin process model behind an `int 0x80` syscall ABI.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod kernel;

use crate::arch::{ArchCpu, Cpu};

// グローバルヒープアロケータ
#[cfg(all(target_arch = "x86", not(test)))]
#[global_allocator]
static ALLOCATOR: kernel::mm::heap::LockedHeap = kernel::mm::heap::LockedHeap::empty();

/// ヒープを初期化
///
/// # Safety
///
/// カーネルブート時に一度だけ呼ぶこと。`heap_start` から `heap_size`
/// バイトの領域が有効かつ排他的に使用可能であることを呼び出し元が保証する。
#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn init_heap(heap_start: *mut u8, heap_size: usize) {
    debug_assert!(!heap_start.is_null(), "Heap start address must not be null");
    debug_assert!(heap_size > 0, "Heap size must be greater than zero");

    // Safety: 呼び出し元がヒープ領域の有効性を保証している
    unsafe {
        ALLOCATOR.init(heap_start, heap_size);
    }
}

/// グローバルに登録されたカーネルヒープへの参照
#[cfg(all(target_arch = "x86", not(test)))]
pub fn kernel_heap() -> &'static kernel::mm::heap::LockedHeap {
    &ALLOCATOR
}

/// console_print! マクロ - ユーザー向け画面出力
///
/// 実際の出力先（VGA テキストバッファ）はコンソールドライバが決定します。
/// デバッグ出力には `debug_print!` を使用してください。
#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {{
        $crate::kernel::driver::write_console(format_args!($($arg)*));
    }};
}

/// console_println! マクロ - ユーザー向け画面出力（改行付き）
#[macro_export]
macro_rules! console_println {
    () => ($crate::console_print!("\n"));
    ($($arg:tt)*) => ($crate::console_print!("{}\n", format_args!($($arg)*)));
}

/// debug_print! マクロ - デバッグ専用（シリアルポートのみ）
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {{
        $crate::kernel::driver::write_debug(format_args!($($arg)*));
    }};
}

/// debug_println! マクロ - デバッグ専用（改行付き）
#[macro_export]
macro_rules! debug_println {
    () => ($crate::debug_print!("\n"));
    ($($arg:tt)*) => ($crate::debug_print!("{}\n", format_args!($($arg)*)));
}

/// println! マクロ - コンソール出力とデバッグ出力の両方
#[macro_export]
macro_rules! println {
    () => {{
        $crate::console_print!("\n");
        $crate::debug_print!("\n");
    }};
    ($($arg:tt)*) => {{
        $crate::console_print!("{}\n", format_args!($($arg)*));
        $crate::debug_print!("{}\n", format_args!($($arg)*));
    }};
}

/// print! マクロ - コンソール出力とデバッグ出力の両方
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        $crate::console_print!($($arg)*);
        $crate::debug_print!($($arg)*);
    }};
}

/// Halt loop
#[inline]
pub fn hlt_loop() -> ! {
    loop {
        ArchCpu::halt();
    }
}
