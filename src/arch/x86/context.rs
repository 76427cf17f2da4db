// src/arch/x86/context.rs
//! コンテキストスイッチとユーザーモード遷移

use crate::kernel::trap::RegisterFrame;

core::arch::global_asm!(
    r"
.global switch_context
switch_context:
    push ebp
    push ebx
    push esi
    push edi
    mov eax, [esp + 20]
    mov [eax], esp
    mov eax, [esp + 24]
    mov esp, eax
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"
);

unsafe extern "C" {
    /// カーネルスタックを切り替える
    ///
    /// 呼び出し側の callee-saved レジスタを現在のスタックに積み、その esp を
    /// `*old_esp` に保存してから `new_esp` に載せ替えて戻る。新しいスタックは
    /// 過去の `switch_context` 呼び出し、または `seed_stack` が作った
    /// ブートストラップフレームを指していること。
    pub fn switch_context(old_esp: *mut u32, new_esp: u32);
}

/// 新規プロセスのカーネルスタックにブートストラップフレームを積む
///
/// 作られたスタックに `switch_context` で切り替えると `entry` が呼ばれる。
/// 戻り先は無いので `entry` は発散すること。
///
/// # Safety
///
/// `stack_top` は 4 バイト境界の有効なスタック上端であること。
pub unsafe fn seed_stack(stack_top: *mut u32, entry: extern "C" fn() -> !) -> u32 {
    // [edi][esi][ebx][ebp][ret -> entry] の 5 ワード
    unsafe {
        let base = stack_top.sub(5);
        base.write(0); // edi
        base.add(1).write(0); // esi
        base.add(2).write(0); // ebx
        base.add(3).write(0); // ebp
        base.add(4).write(entry as usize as u32);
        base as u32
    }
}

/// 保存済みレジスタフレームで iret し、ユーザーモードへ戻る
///
/// 割り込みスタブの復帰パスと同じ手順でフレームを展開する。fork 直後の
/// 子プロセスの初回ディスパッチと、exec 後のエントリの両方がこれを使う。
///
/// # Safety
///
/// フレームの cs/ss/eip/useresp が有効なユーザーモード状態を指しており、
/// 対象のアドレス空間がアクティブであること。
pub unsafe fn enter_user_frame(frame: *const RegisterFrame) -> ! {
    // SAFETY: 呼び出し元がフレームの有効性とアドレス空間を保証している
    unsafe {
        core::arch::asm!(
            "mov esp, {0}",
            "pop eax",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "popad",
            "add esp, 8",
            "iretd",
            in(reg) frame,
            options(noreturn)
        )
    }
}
