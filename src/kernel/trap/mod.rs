// src/kernel/trap/mod.rs
//! Trap plane
//!
//! CPU 例外 (0-31)、PIC 経由の IRQ (32-47)、syscall (0x80) を型付き
//! ハンドラへ多重化します。エントリスタブが積んだレジスタフレームへの
//! ポインタがそのままハンドラに渡り、iret まで生存します。

use crate::arch::x86::pic::{IRQ_OFFSET, PICS};
use crate::debug_println;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// トラップ・割り込み・syscall 進入時に保存されるレジスタフレーム
///
/// エントリスタブのプッシュ順と一致する。アドレス昇順に、スタブが積んだ
/// ds と汎用レジスタ、ベクタ番号とエラーコード、CPU が積んだ復帰情報。
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegisterFrame {
    /// 進入時のデータセグメント
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// pusha が積むダミーの esp（復帰には使われない）
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    /// ベクタ番号
    pub int_no: u32,
    /// エラーコード（ハードウェアが積まないベクタでは 0）
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// 特権遷移時のみ有効なユーザースタックポインタ
    pub useresp: u32,
    /// 特権遷移時のみ有効なスタックセグメント
    pub ss: u32,
}

impl RegisterFrame {
    /// 全フィールドゼロのフレーム
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            int_no: 0,
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }

    /// ユーザーモードへ iret するための初期フレームを作成
    #[must_use]
    pub fn user_entry(entry: u32, user_stack: u32) -> Self {
        use crate::arch::x86::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
        let mut frame = Self::zeroed();
        frame.ds = u32::from(USER_DATA_SELECTOR);
        frame.eip = entry;
        frame.cs = u32::from(USER_CODE_SELECTOR);
        frame.eflags = 0x202; // IF セット
        frame.useresp = user_stack;
        frame.ss = u32::from(USER_DATA_SELECTOR);
        frame
    }
}

/// トラップハンドラ型
pub type TrapHandler = fn(&mut RegisterFrame);

/// CPU 例外名 (ベクタ 0-31)
pub static EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Security Exception",
    "Reserved",
];

static EXCEPTION_HANDLERS: Mutex<[Option<TrapHandler>; 32]> = Mutex::new([None; 32]);
static IRQ_HANDLERS: Mutex<[Option<TrapHandler>; 16]> = Mutex::new([None; 16]);

/// タイマ側が立てる再スケジュール要求。EOI 送信後のトラップ出口で消費される。
pub static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// 例外ハンドラを登録
pub fn register_exception_handler(vector: u8, handler: TrapHandler) {
    if (vector as usize) < 32 {
        EXCEPTION_HANDLERS.lock()[vector as usize] = Some(handler);
    }
}

/// IRQ ハンドラを登録 (irq は 0-15)
pub fn register_irq_handler(irq: u8, handler: TrapHandler) {
    if (irq as usize) < 16 {
        IRQ_HANDLERS.lock()[irq as usize] = Some(handler);
    }
}

/// 例外ディスパッチャ
///
/// 登録済みハンドラがあれば呼び、無ければ例外名とエラーコード、保存 EIP を
/// 表示して CPU を停止する。
pub fn dispatch_exception(frame: &mut RegisterFrame) {
    let vector = frame.int_no as usize;
    let handler = if vector < 32 {
        EXCEPTION_HANDLERS.lock()[vector]
    } else {
        None
    };

    if let Some(handler) = handler {
        handler(frame);
        return;
    }

    if vector < 32 {
        crate::console_println!("\n!!! EXCEPTION: {} !!!", EXCEPTION_NAMES[vector]);
        crate::console_println!("Error code: {}", frame.err_code);
        crate::console_println!("EIP: {:#010x}", frame.eip);
        crate::console_println!("System halted.");
        debug_println!(
            "[TRAP] fatal exception {} err={:#x} eip={:#010x}",
            EXCEPTION_NAMES[vector],
            frame.err_code,
            frame.eip
        );
        <crate::arch::ArchCpu as crate::arch::Cpu>::disable_interrupts();
        crate::hlt_loop();
    }
}

/// IRQ ディスパッチャ
///
/// 登録済みハンドラを呼んでから EOI を送る。Slave 由来 (ベクタ >= 40) なら
/// Slave へ先に、Master へは常に送る。タイマが再スケジュールを要求して
/// いれば、EOI 送信後にここでスケジューラへ入る。
pub fn dispatch_irq(frame: &mut RegisterFrame) {
    let irq = frame.int_no.wrapping_sub(u32::from(IRQ_OFFSET)) as usize;
    let handler = if irq < 16 { IRQ_HANDLERS.lock()[irq] } else { None };

    if let Some(handler) = handler {
        handler(frame);
    }

    // SAFETY: 割り込みコンテキスト内で対応するベクタ番号を渡している
    unsafe {
        PICS.lock().notify_end_of_interrupt(frame.int_no as u8);
    }

    if NEED_RESCHED.swap(false, Ordering::AcqRel) {
        crate::kernel::process::schedule_next();
    }
}

#[unsafe(no_mangle)]
extern "C" fn trap_exception_dispatch(frame: *mut RegisterFrame) {
    // SAFETY: スタブはカーネルスタック上の有効なフレームを渡してくる
    dispatch_exception(unsafe { &mut *frame });
}

#[unsafe(no_mangle)]
extern "C" fn trap_irq_dispatch(frame: *mut RegisterFrame) {
    // SAFETY: スタブはカーネルスタック上の有効なフレームを渡してくる
    dispatch_irq(unsafe { &mut *frame });
}

#[unsafe(no_mangle)]
extern "C" fn trap_syscall_dispatch(frame: *mut RegisterFrame) {
    // SAFETY: スタブはカーネルスタック上の有効なフレームを渡してくる
    crate::kernel::syscall::dispatch(unsafe { &mut *frame });
}

/// IDT にスタブを配線し、PIC をリマップして割り込みを有効化する
#[cfg(target_arch = "x86")]
pub fn init() {
    use crate::arch::x86::idt::{GATE_INTERRUPT, GATE_USER, IDT};
    use crate::arch::x86::stubs;
    use crate::arch::{ArchCpu, Cpu};

    {
        let mut idt = IDT.lock();
        for (vector, stub) in stubs::exception_stubs().iter().enumerate() {
            idt.set_gate(vector as u8, *stub, GATE_INTERRUPT);
        }
        for (i, stub) in stubs::irq_stubs().iter().enumerate() {
            idt.set_gate(IRQ_OFFSET + i as u8, *stub, GATE_INTERRUPT);
        }
        // int 0x80 はユーザーモードから起動できる必要がある
        idt.set_gate(0x80, stubs::syscall_stub(), GATE_USER);
        // SAFETY: IDT はグローバル static で 'static、ゲートは設定済み
        unsafe {
            idt.load();
        }
    }

    // SAFETY: IDT ロード後の一度きりの初期化
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.unmask_irq(0); // タイマ
        pics.unmask_irq(1); // キーボード
        pics.unmask_irq(2); // カスケード
    }

    ArchCpu::enable_interrupts();
    debug_println!("[TRAP] IDT loaded, PIC remapped to 32/40");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_handler(frame: &mut RegisterFrame) {
        frame.eax = 0x55;
    }

    #[test]
    fn registered_exception_handler_is_invoked() {
        register_exception_handler(3, nop_handler);
        let mut frame = RegisterFrame::zeroed();
        frame.int_no = 3;
        dispatch_exception(&mut frame);
        assert_eq!(frame.eax, 0x55);
    }

    #[test]
    fn irq_dispatch_translates_vector_to_irq_line() {
        register_irq_handler(7, nop_handler);
        let mut frame = RegisterFrame::zeroed();
        frame.int_no = 32 + 7;
        dispatch_irq(&mut frame);
        assert_eq!(frame.eax, 0x55);
    }

    #[test]
    fn user_entry_frame_targets_ring3() {
        let frame = RegisterFrame::user_entry(0x8004_8000, 0xFFFF_0000);
        assert_eq!(frame.eip, 0x8004_8000);
        assert_eq!(frame.useresp, 0xFFFF_0000);
        assert_eq!(frame.cs & 0x3, 0x3);
        assert_eq!(frame.eflags & 0x200, 0x200);
    }
}
