// src/arch/x86/idt.rs
//! Interrupt Descriptor Table
//!
//! 256 エントリの IDT を構築してロードします。ゲートの中身
//! （例外・IRQ・syscall の各スタブ）は trap プレーンの初期化時に
//! `set_gate` で設定されます。

use crate::arch::x86::KERNEL_CODE_SELECTOR;
use spin::Mutex;

/// 割り込みゲート（DPL=0, 32-bit interrupt gate, present）
pub const GATE_INTERRUPT: u8 = 0x8E;
/// ユーザーから int 命令で起動できるゲート（DPL=3）
pub const GATE_USER: u8 = 0xEE;

/// IDT エントリ
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    base_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    base_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            base_low: 0,
            selector: 0,
            zero: 0,
            flags: 0,
            base_high: 0,
        }
    }
}

/// IDT ポインタ (lidt オペランド)
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

/// Interrupt Descriptor Table 本体
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    /// 空の IDT を作成
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); 256],
        }
    }

    /// ゲートを設定
    pub fn set_gate(&mut self, vector: u8, handler: u32, flags: u8) {
        let entry = &mut self.entries[vector as usize];
        entry.base_low = (handler & 0xFFFF) as u16;
        entry.base_high = ((handler >> 16) & 0xFFFF) as u16;
        entry.selector = KERNEL_CODE_SELECTOR;
        entry.zero = 0;
        entry.flags = flags;
    }

    /// IDT を CPU にロード
    ///
    /// # Safety
    ///
    /// `self` が `'static` な領域にあり、設定済みのゲートが有効な
    /// ハンドラを指していること。
    pub unsafe fn load(&self) {
        #[cfg(target_arch = "x86")]
        {
            let pointer = IdtPointer {
                limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
                base: self.entries.as_ptr() as u32,
            };
            // SAFETY: 呼び出し元が IDT の有効性と 'static 性を保証している
            unsafe {
                core::arch::asm!("lidt [{0}]", in(reg) &pointer, options(nostack));
            }
        }
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

/// グローバル IDT
pub static IDT: Mutex<Idt> = Mutex::new(Idt::new());
