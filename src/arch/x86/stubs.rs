// src/arch/x86/stubs.rs
//! 割り込みエントリスタブ
//!
//! 例外 (0-31)、IRQ (32-47)、syscall (0x80) の各エントリは、ハードウェアが
//! 積まないベクタではダミーエラーコードを積み、ベクタ番号と全レジスタ、
//! データセグメントを保存してから Rust 側のディスパッチャへ渡します。
//! スタックレイアウトは `kernel::trap::RegisterFrame` と一致している
//! 必要があります。

// 例外スタブ。ベクタ 8, 10-14, 17, 30 はハードウェアがエラーコードを
// 積むため ERR 版を使う。
core::arch::global_asm!(
    r"
.macro ISR_NOERR num
.global isr\num
isr\num:
    cli
    push 0
    push \num
    jmp isr_common
.endm

.macro ISR_ERR num
.global isr\num
isr\num:
    cli
    push \num
    jmp isr_common
.endm

ISR_NOERR 0
ISR_NOERR 1
ISR_NOERR 2
ISR_NOERR 3
ISR_NOERR 4
ISR_NOERR 5
ISR_NOERR 6
ISR_NOERR 7
ISR_ERR   8
ISR_NOERR 9
ISR_ERR   10
ISR_ERR   11
ISR_ERR   12
ISR_ERR   13
ISR_ERR   14
ISR_NOERR 15
ISR_NOERR 16
ISR_ERR   17
ISR_NOERR 18
ISR_NOERR 19
ISR_NOERR 20
ISR_NOERR 21
ISR_NOERR 22
ISR_NOERR 23
ISR_NOERR 24
ISR_NOERR 25
ISR_NOERR 26
ISR_NOERR 27
ISR_NOERR 28
ISR_NOERR 29
ISR_ERR   30
ISR_NOERR 31

isr_common:
    pushad
    push ds
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_exception_dispatch
    add esp, 4
    pop eax
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    popad
    add esp, 8
    iretd
"
);

// IRQ スタブ。PIC リマップ後のベクタ番号 (32-47) を積む。
core::arch::global_asm!(
    r"
.macro IRQ num, vector
.global irq\num
irq\num:
    cli
    push 0
    push \vector
    jmp irq_common
.endm

IRQ 0, 32
IRQ 1, 33
IRQ 2, 34
IRQ 3, 35
IRQ 4, 36
IRQ 5, 37
IRQ 6, 38
IRQ 7, 39
IRQ 8, 40
IRQ 9, 41
IRQ 10, 42
IRQ 11, 43
IRQ 12, 44
IRQ 13, 45
IRQ 14, 46
IRQ 15, 47

irq_common:
    pushad
    push ds
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_irq_dispatch
    add esp, 4
    pop eax
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    popad
    add esp, 8
    iretd
"
);

// syscall スタブ (int 0x80)。エラーコードは無いのでダミーを積む。
core::arch::global_asm!(
    r"
.global int80_stub
int80_stub:
    push 0
    push 0x80
    pushad
    push ds
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_syscall_dispatch
    add esp, 4
    pop eax
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    popad
    add esp, 8
    iretd
"
);

macro_rules! stub_addrs {
    ($($name:ident),+ $(,)?) => {{
        unsafe extern "C" {
            $(fn $name();)+
        }
        [$($name as usize as u32),+]
    }};
}

/// 例外スタブ (ベクタ 0-31) のエントリアドレス
#[must_use]
pub fn exception_stubs() -> [u32; 32] {
    stub_addrs![
        isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13,
        isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26,
        isr27, isr28, isr29, isr30, isr31,
    ]
}

/// IRQ スタブ (ベクタ 32-47) のエントリアドレス
#[must_use]
pub fn irq_stubs() -> [u32; 16] {
    stub_addrs![
        irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
        irq14, irq15,
    ]
}

/// syscall スタブ (ベクタ 0x80) のエントリアドレス
#[must_use]
pub fn syscall_stub() -> u32 {
    unsafe extern "C" {
        fn int80_stub();
    }
    int80_stub as usize as u32
}
