// src/kernel/process/lifecycle.rs
//! fork / exec / exit / wait / kill
//!
//! fork はアドレス空間のディープコピー。exec は新しい空間にイメージを
//! 積んでユーザースタックを組み立て、fd テーブルと cwd は残す。exit は
//! レコードをゾンビ化して子を init に付け替え、wait 中の親を起こす。
//! kill はこの世代では即時終了のみで、シグナル番号が終了コードになる。

use crate::debug_println;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::driver::pit;
use crate::kernel::loader;
use crate::kernel::mm::{
    AddressSpace, PageFlags, VirtAddr, FRAME_ALLOCATOR, PAGE_SIZE, USER_STACK_PAGES,
    USER_STACK_TOP,
};
use crate::kernel::process::{Pid, Process, ProcessState, PROCESS_TABLE};
use crate::kernel::scheduler::SCHEDULER;
use crate::kernel::trap::RegisterFrame;
use alloc::string::String;

/// wait のスキャン結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 子を刈り取った
    Reaped {
        /// 刈り取った子の pid
        pid: Pid,
        /// 子の終了コード
        code: i32,
    },
    /// 子プロセスがいない
    NoChildren,
    /// 子はいるがまだ終了していない
    WouldBlock,
}

/// 現在のプロセスを複製する
///
/// 子はユーザー空間のディープコピーと fd テーブルの値コピーを受け取る。
/// 子の保存フレームは `frame` のコピーで、アキュムレータのみ 0（fork の
/// 子側の戻り値）。親側の戻り値は syscall 層が書く。
pub fn fork(frame: &RegisterFrame) -> KernelResult<Pid> {
    let mut table = PROCESS_TABLE.lock();

    let (cloned_space, parent_pid, name, cwd, fds) = {
        let parent = table
            .current()
            .ok_or(KernelError::new(ErrorKind::NotFound))?;
        let space = parent
            .space
            .as_ref()
            .ok_or(KernelError::with_context(
                ErrorKind::Permission,
                "fork from kernel context",
            ))?;
        let mut frames = FRAME_ALLOCATOR.lock();
        let cloned = AddressSpace::clone_from(space, &mut frames)?;
        (
            cloned,
            parent.pid(),
            parent.name.clone(),
            parent.cwd.clone(),
            parent.fds.clone(),
        )
    };

    let mut kernel_stack = alloc::vec![0u8; super::KERNEL_STACK_SIZE].into_boxed_slice();
    let context_esp = super::seed_kernel_stack(&mut kernel_stack);

    let mut user_frame = *frame;
    user_frame.eax = 0;

    let child = table.allocate_pid();
    table.insert(Process {
        pid: child,
        parent: parent_pid,
        state: ProcessState::Ready,
        name,
        cwd,
        fds,
        space: Some(cloned_space),
        exit_code: 0,
        start_tick: pit::ticks(),
        context_esp,
        user_frame,
        kernel_stack: Some(kernel_stack),
    });
    SCHEDULER.lock().add(child);

    debug_println!(
        "[PROC] fork: {} -> {}",
        parent_pid.as_u32(),
        child.as_u32()
    );
    Ok(child)
}

/// ユーザースタックを用意して argc/argv を cdecl 規約で積む
///
/// 返り値はエントリ直後の esp。スタックレイアウトは
/// `[ret][argc][argv] ... 引数ポインタ配列 ... 文字列本体` で、
/// 呼び出し先からは `[esp+4]=argc`, `[esp+8]=argv` に見える。
fn build_user_stack(
    space: &mut AddressSpace,
    argv: &[&str],
) -> KernelResult<u32> {
    {
        let mut frames = FRAME_ALLOCATOR.lock();
        let stack_base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u32;
        for i in 0..USER_STACK_PAGES {
            let va = stack_base + (i * PAGE_SIZE) as u32;
            let frame = frames.alloc();
            if frame.is_null() {
                return Err(KernelError::with_context(
                    ErrorKind::Exhausted,
                    "user stack frame",
                ));
            }
            space.map(
                &mut frames,
                VirtAddr::new(va),
                frame,
                PageFlags::WRITABLE | PageFlags::USER,
            )?;
            space.zero_range(VirtAddr::new(va), PAGE_SIZE)?;
        }
    }

    let mut sp = USER_STACK_TOP;

    // 文字列本体
    let mut arg_addrs = alloc::vec::Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        sp -= arg.len() as u32 + 1;
        space.write_bytes(VirtAddr::new(sp), arg.as_bytes())?;
        space.write_bytes(VirtAddr::new(sp + arg.len() as u32), &[0])?;
        arg_addrs.push(sp);
    }
    arg_addrs.reverse();

    sp &= !3;

    // 引数ポインタ配列 + NULL 終端
    sp -= 4 * (argv.len() as u32 + 1);
    let argv_base = sp;
    for (i, addr) in arg_addrs.iter().enumerate() {
        space.write_bytes(
            VirtAddr::new(argv_base + 4 * i as u32),
            &addr.to_le_bytes(),
        )?;
    }
    space.write_bytes(
        VirtAddr::new(argv_base + 4 * argv.len() as u32),
        &0u32.to_le_bytes(),
    )?;

    // [ret][argc][argv]
    sp -= 4;
    space.write_bytes(VirtAddr::new(sp), &argv_base.to_le_bytes())?;
    sp -= 4;
    space.write_bytes(VirtAddr::new(sp), &(argv.len() as u32).to_le_bytes())?;
    sp -= 4;
    space.write_bytes(VirtAddr::new(sp), &0u32.to_le_bytes())?;

    Ok(sp)
}

/// 現在のプロセスのイメージを入れ替える
///
/// 新しい空間にイメージとスタックを構築してから差し替えるので、失敗時は
/// 旧イメージのまま呼び出し元に戻れる。成功時は現在プロセスの
/// `user_frame` が新しいエントリ状態を指す。fd テーブルと cwd は生き残る。
pub fn exec_current(image: &[u8], argv: &[&str]) -> KernelResult<u32> {
    let mut new_space = {
        let mut frames = FRAME_ALLOCATOR.lock();
        AddressSpace::create(&mut frames)?
    };

    let entry = {
        let result = {
            let mut frames = FRAME_ALLOCATOR.lock();
            loader::load_image(image, &mut new_space, &mut frames)
        };
        match result {
            Ok(entry) => entry,
            Err(e) => {
                let mut frames = FRAME_ALLOCATOR.lock();
                new_space.destroy(&mut frames);
                return Err(e);
            }
        }
    };

    let esp = match build_user_stack(&mut new_space, argv) {
        Ok(esp) => esp,
        Err(e) => {
            let mut frames = FRAME_ALLOCATOR.lock();
            new_space.destroy(&mut frames);
            return Err(e);
        }
    };

    let mut table = PROCESS_TABLE.lock();
    let current = table
        .current_mut()
        .ok_or(KernelError::new(ErrorKind::NotFound))?;

    if let Some(mut old_space) = current.space.take() {
        let mut frames = FRAME_ALLOCATOR.lock();
        old_space.destroy(&mut frames);
    }
    current.space = Some(new_space);
    current.user_frame = RegisterFrame::user_entry(entry, esp);
    if let Some(name) = argv.first() {
        current.name = String::from(*name);
    }

    debug_println!(
        "[PROC] exec: pid {} entry {:#010x}",
        current.pid().as_u32(),
        entry
    );
    Ok(entry)
}

/// プロセスを終了させる (exit と kill の共通経路)
///
/// レコードはゾンビとして残り、終了コードは親の `wait` が回収する。
/// 全 fd を閉じ、ユーザーフレームを返却し、子は pid 1（不在なら pid 0）
/// に付け替える。wait でブロック中の親は起こす。
pub fn terminate(pid: Pid, code: i32) -> KernelResult<()> {
    if pid == Pid::KERNEL {
        return Err(KernelError::with_context(
            ErrorKind::Permission,
            "cannot terminate the kernel",
        ));
    }

    let mut table = PROCESS_TABLE.lock();
    let parent_pid = {
        let target = table
            .get_mut(pid)
            .ok_or(KernelError::new(ErrorKind::NotFound))?;
        if target.state() == ProcessState::Zombie {
            return Err(KernelError::new(ErrorKind::NotFound));
        }

        target.fds.close_all();
        if let Some(mut space) = target.space.take() {
            let mut frames = FRAME_ALLOCATOR.lock();
            space.destroy(&mut frames);
        }
        target.exit_code = code;
        target.set_state(ProcessState::Zombie);
        target.parent()
    };

    // 孤児は init (不在ならカーネル) が引き取る
    let adopter = if table.get(Pid::INIT).is_some() && pid != Pid::INIT {
        Pid::INIT
    } else {
        Pid::KERNEL
    };
    table.reparent_children(pid, adopter);

    // 親が wait でブロックしていたら起こす
    if let Some(parent) = table.get_mut(parent_pid) {
        if parent.state() == ProcessState::Blocked {
            parent.set_state(ProcessState::Ready);
            SCHEDULER.lock().add(parent_pid);
        }
    }

    SCHEDULER.lock().remove(pid);
    debug_println!("[PROC] pid {} exited with {}", pid.as_u32(), code);
    Ok(())
}

/// 親の子スキャンを 1 回行う
///
/// ゾンビが見つかればレコードを外して解放し、その pid と終了コードを
/// 返す。子がいなければ `NoChildren`。どちらでもなければ `WouldBlock` で、
/// 呼び出し元がブロックと再スキャンを行う。
pub fn wait_scan(parent: Pid) -> WaitOutcome {
    let mut table = PROCESS_TABLE.lock();
    if let Some((child, code)) = table.find_zombie_child(parent) {
        if let Some(mut reaped) = table.remove(child) {
            reaped.set_state(ProcessState::Dead);
        }
        return WaitOutcome::Reaped { pid: child, code };
    }
    if !table.has_children(parent) {
        return WaitOutcome::NoChildren;
    }
    WaitOutcome::WouldBlock
}

/// シグナル送達 (この世代では常に終了)
///
/// pid 0 は拒否。終了コードにはシグナル番号が入る。
pub fn kill(pid: Pid, signal: u32) -> KernelResult<()> {
    if pid == Pid::KERNEL {
        return Err(KernelError::with_context(ErrorKind::Permission, "kill pid 0"));
    }
    terminate(pid, signal as i32)
}
