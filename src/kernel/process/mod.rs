// src/kernel/process/mod.rs
//! Process management
//!
//! プロセスレコードとプロセステーブル、スケジューラ進入点を提供します。
//! pid 0 はカーネル。pid は 1 から単調に採番され、常にちょうど 1 つの
//! プロセスが Running。ゾンビは親が `wait` で刈り取るまでレコードを保持
//! します。

pub mod lifecycle;

use crate::debug_println;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::driver::pit;
use crate::kernel::fs::FdTable;
use crate::kernel::mm::{AddressSpace, FRAME_ALLOCATOR};
use crate::kernel::scheduler::SCHEDULER;
use crate::kernel::trap::RegisterFrame;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

/// プロセス ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// カーネル自身の pid
    pub const KERNEL: Self = Self(0);
    /// init (再親付けの引き取り先)
    pub const INIT: Self = Self(1);

    /// pid を作成
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// 数値を取得
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// プロセス状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// 実行可能
    Ready,
    /// 実行中
    Running,
    /// wait などで停止中
    Blocked,
    /// 終了済み・未回収
    Zombie,
    /// 回収済み（テーブルから消える直前の過渡状態）
    Dead,
}

impl ProcessState {
    /// getprocs が返す数値表現
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Ready => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Zombie => 3,
            Self::Dead => 4,
        }
    }
}

/// プロセス毎のカーネルスタックサイズ (16 KiB)
const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// プロセスレコード
pub struct Process {
    pid: Pid,
    parent: Pid,
    state: ProcessState,
    /// プロセス名
    pub name: String,
    /// カレントワーキングディレクトリ（正規形絶対パス）
    pub cwd: String,
    /// ファイルディスクリプタ表
    pub fds: FdTable,
    /// アドレス空間（カーネルプロセスは持たない）
    pub space: Option<AddressSpace>,
    exit_code: i32,
    start_tick: u32,
    /// switch_context が保存するカーネルスタックポインタ
    context_esp: u32,
    /// 初回ディスパッチ・fork 復帰に使うユーザーフレーム
    pub user_frame: RegisterFrame,
    #[allow(dead_code)]
    kernel_stack: Option<Box<[u8]>>,
}

impl Process {
    /// pid を取得
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// 親 pid を取得
    #[must_use]
    pub const fn parent(&self) -> Pid {
        self.parent
    }

    /// 状態を取得
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// 状態を設定
    pub const fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    /// 終了コードを取得
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// 開始ティック
    #[must_use]
    pub const fn start_tick(&self) -> u32 {
        self.start_tick
    }

    /// 保存コンテキストへのポインタ
    pub fn context_esp_mut(&mut self) -> *mut u32 {
        &mut self.context_esp
    }
}

/// getprocs がユーザーへ返すレコード
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProcInfo {
    pub pid: u32,
    pub ppid: u32,
    pub state: u32,
    pub name: [u8; 64],
    pub memory_used: u32,
    pub cpu_time: u32,
}

/// プロセステーブル
pub struct ProcessTable {
    procs: Vec<Process>,
    next_pid: u32,
    current: Pid,
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            procs: Vec::new(),
            next_pid: 1,
            current: Pid::KERNEL,
        }
    }

    /// pid 0 のカーネルプロセスを据えて初期化する
    pub fn init(&mut self) {
        self.procs.clear();
        self.next_pid = 1;
        self.current = Pid::KERNEL;
        self.procs.push(Process {
            pid: Pid::KERNEL,
            parent: Pid::KERNEL,
            state: ProcessState::Running,
            name: String::from("kernel"),
            cwd: String::from("/"),
            fds: FdTable::new(),
            space: None,
            exit_code: 0,
            start_tick: 0,
            context_esp: 0,
            user_frame: RegisterFrame::zeroed(),
            kernel_stack: None,
        });
    }

    /// pid を採番する
    pub const fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// レコードを追加する
    pub fn insert(&mut self, process: Process) {
        self.procs.push(process);
    }

    /// pid でレコードを引く
    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.iter().find(|p| p.pid == pid)
    }

    /// pid でレコードを可変で引く
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.iter_mut().find(|p| p.pid == pid)
    }

    /// 現在のプロセスの pid
    #[must_use]
    pub const fn current_pid(&self) -> Pid {
        self.current
    }

    /// 現在のプロセス
    #[must_use]
    pub fn current(&self) -> Option<&Process> {
        self.get(self.current)
    }

    /// 現在のプロセス（可変）
    pub fn current_mut(&mut self) -> Option<&mut Process> {
        let pid = self.current;
        self.get_mut(pid)
    }

    /// 現在のプロセスを切り替える
    pub const fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    /// レコードを取り除いて返す（wait の刈り取り）
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let index = self.procs.iter().position(|p| p.pid == pid)?;
        Some(self.procs.remove(index))
    }

    /// 親 pid が一致するゾンビを探す
    #[must_use]
    pub fn find_zombie_child(&self, parent: Pid) -> Option<(Pid, i32)> {
        self.procs
            .iter()
            .find(|p| p.parent == parent && p.state == ProcessState::Zombie)
            .map(|p| (p.pid, p.exit_code))
    }

    /// 子プロセスを持つか
    #[must_use]
    pub fn has_children(&self, parent: Pid) -> bool {
        self.procs.iter().any(|p| p.parent == parent)
    }

    /// 孤児を `new_parent` に付け替える
    pub fn reparent_children(&mut self, dead: Pid, new_parent: Pid) {
        for p in &mut self.procs {
            if p.parent == dead {
                p.parent = new_parent;
            }
        }
    }

    /// テーブル上のプロセス数
    #[must_use]
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    /// テーブルが空か
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// 全レコードの一覧を取る
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProcInfo> {
        self.procs
            .iter()
            .map(|p| {
                let mut name = [0u8; 64];
                let bytes = p.name.as_bytes();
                let len = bytes.len().min(63);
                name[..len].copy_from_slice(&bytes[..len]);
                ProcInfo {
                    pid: p.pid.as_u32(),
                    ppid: p.parent.as_u32(),
                    state: p.state.as_u32(),
                    name,
                    memory_used: 0,
                    cpu_time: pit::ticks().wrapping_sub(p.start_tick),
                }
            })
            .collect()
    }
}

lazy_static! {
    /// グローバルプロセステーブル
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

/// プロセス管理を初期化する (pid 0 の据え付け)
pub fn init() {
    PROCESS_TABLE.lock().init();
    debug_println!("[PROC] process table ready (pid 0 = kernel)");
}

/// 新しいユーザープロセスのレコードを作る
///
/// アドレス空間はカーネルマッピングを共有した空の状態。呼び出し元が
/// exec 相当でイメージを積んでからスケジューラに登録する。
pub fn create_process(name: &str) -> KernelResult<Pid> {
    let space = {
        let mut frames = FRAME_ALLOCATOR.lock();
        AddressSpace::create(&mut frames)?
    };

    let mut kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let context_esp = seed_kernel_stack(&mut kernel_stack);

    let mut table = PROCESS_TABLE.lock();
    let pid = table.allocate_pid();
    let parent = table.current_pid();
    table.insert(Process {
        pid,
        parent,
        state: ProcessState::Ready,
        name: String::from(name),
        cwd: String::from("/"),
        fds: FdTable::new(),
        space: Some(space),
        exit_code: 0,
        start_tick: pit::ticks(),
        context_esp,
        user_frame: RegisterFrame::zeroed(),
        kernel_stack: Some(kernel_stack),
    });
    debug_println!("[PROC] created pid {} ('{}')", pid.as_u32(), name);
    Ok(pid)
}

/// 新規プロセスのカーネルスタックにブートストラップフレームを積む
fn seed_kernel_stack(stack: &mut Box<[u8]>) -> u32 {
    #[cfg(target_arch = "x86")]
    {
        // SAFETY: top はこのプロセス専用スタックの上端
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) }.cast::<u32>();
        // SAFETY: 同上
        return unsafe { crate::arch::x86::context::seed_stack(top, process_bootstrap) };
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = stack;
        return 0;
    }
}

/// 初回ディスパッチ: 保存済みユーザーフレームへ iret する
#[cfg(target_arch = "x86")]
extern "C" fn process_bootstrap() -> ! {
    let frame = {
        let table = PROCESS_TABLE.lock();
        let current = table.current().expect("bootstrap without current process");
        current.user_frame
    };
    // SAFETY: user_frame は exec/fork が構築した有効なユーザー状態で、
    // schedule_next が対象空間をアクティブにしてから切り替えている
    unsafe { crate::arch::x86::context::enter_user_frame(&frame) }
}

/// スケジューリング決定を 1 回行う
///
/// カーソルを次の Ready スロットへ進め、出て行くプロセスを Ready に戻し、
/// 入ってくるプロセスを Running にしてアドレス空間を切り替える。
/// レジスタ状態の入れ替えはコンテキストスイッチプリミティブが行う。
pub fn schedule_next() {
    // スイッチ判断から切り替え完了までは割り込み禁止。切り替え先では
    // トラップ出口の iret（または初回ディスパッチ）がフラグを復元する。
    #[cfg(target_arch = "x86")]
    <crate::arch::ArchCpu as crate::arch::Cpu>::disable_interrupts();

    let switch = {
        let mut table = PROCESS_TABLE.lock();
        let mut scheduler = SCHEDULER.lock();

        let current_pid = table.current_pid();

        // 実行中のまま来たら実行可能に戻す（exit/block 済みなら触らない）
        if let Some(current) = table.current_mut() {
            if current.state() == ProcessState::Running {
                current.set_state(ProcessState::Ready);
            }
        }

        let mut next_pid = None;
        for _ in 0..scheduler.queue_len() {
            let Some(candidate) = scheduler.rotate() else {
                break;
            };
            if table.get(candidate).map(Process::state) == Some(ProcessState::Ready) {
                next_pid = Some(candidate);
                break;
            }
        }

        match next_pid {
            None => {
                // 他に走るものが無い。自分がまだ走れるなら続行
                if let Some(current) = table.current_mut() {
                    if current.state() == ProcessState::Ready {
                        current.set_state(ProcessState::Running);
                    }
                }
                None
            }
            Some(next) if next == current_pid => {
                if let Some(current) = table.current_mut() {
                    current.set_state(ProcessState::Running);
                }
                None
            }
            Some(next) => {
                let old_ctx = table.current_mut().map(|p| p.context_esp_mut());
                table.set_current(next);
                let incoming = table.get_mut(next).expect("scheduled pid vanished");
                incoming.set_state(ProcessState::Running);
                if let Some(space) = &incoming.space {
                    space.activate();
                }
                let new_esp = incoming.context_esp;
                old_ctx.map(|old| (old, new_esp))
            }
        }
    };

    #[cfg(target_arch = "x86")]
    if let Some((old_ctx, new_esp)) = switch {
        // SAFETY: 双方のコンテキストはプロセステーブルが所有する
        // カーネルスタックを指す
        unsafe {
            crate::arch::x86::context::switch_context(old_ctx, new_esp);
        }
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = switch;
}

/// 明示的 yield
pub fn yield_now() {
    schedule_next();
}

/// 現在の pid
#[must_use]
pub fn current_pid() -> Pid {
    PROCESS_TABLE.lock().current_pid()
}

/// pid の存在確認
#[must_use]
pub fn process_exists(pid: Pid) -> bool {
    PROCESS_TABLE.lock().get(pid).is_some()
}

/// 実行中プロセス一覧
#[must_use]
pub fn process_snapshot() -> Vec<ProcInfo> {
    PROCESS_TABLE.lock().snapshot()
}

/// pid で引けなければ `NotFound`
pub fn require_process(pid: Pid) -> KernelResult<()> {
    if process_exists(pid) {
        Ok(())
    } else {
        Err(KernelError::new(ErrorKind::NotFound))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! プロセス・syscall テストの共通セットアップ
    //!
    //! テーブルとスケジューラはグローバルなので、これらを使うテストは
    //! `lock()` で直列化してから `reset()` する。

    use super::*;
    use crate::kernel::mm::test_support::init_global_frames;
    use crate::kernel::scheduler;

    pub static PROC_TEST_LOCK: Mutex<()> = Mutex::new(());

    /// テーブル・スケジューラ・グローバルフレームを初期化する
    pub fn reset(frames: usize) {
        init_global_frames(frames);
        PROCESS_TABLE.lock().init();
        scheduler::SCHEDULER.lock().clear();
    }
}
