// src/kernel/syscall/mod.rs
//! Syscall dispatch (int 0x80)
//!
//! 番号はアキュムレータ、引数はレジスタ 3 つ、返り値はフレームの
//! アキュムレータに書き戻されて iret でユーザーに届きます。未知の番号と
//! ヌルポインタ引数は -1。fd 0/1/2 はテーブル状態に関わらずキーボード／
//! コンソールへ短絡します。ユーザーに見える失敗はすべて -1 で、errno 面
//! はありません。

use crate::debug_println;
use crate::kernel::driver::{self, keyboard, pit};
use crate::kernel::fs::{vfs, Dirent, OpenFlags, Stat};
use crate::kernel::mm::heap::{kfree, kmalloc};
use crate::kernel::process::{self, lifecycle, Pid, ProcessState, PROCESS_TABLE};
use crate::kernel::trap::RegisterFrame;
use alloc::string::String;
use alloc::vec::Vec;

/// デバイスハンドルを表す fd の下駄
///
/// `open("/dev/...")` はこの値以上の fd を返し、VFS の fd 空間と
/// 衝突しない。
pub const DEV_FD_BASE: u32 = 0x1000;

/// syscall 番号 (安定 ABI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit,
    Write,
    Read,
    Open,
    Close,
    Seek,
    Stat,
    Getpid,
    Fork,
    Exec,
    Wait,
    Malloc,
    Free,
    Gettime,
    Sleep,
    Readdir,
    Mkdir,
    Rmdir,
    Unlink,
    Mount,
    Umount,
    LoadDriver,
    Ioctl,
    Getcwd,
    Chdir,
    Kill,
    Getprocs,
}

impl Syscall {
    /// 番号から syscall を引く
    #[must_use]
    pub const fn from_number(number: u32) -> Option<Self> {
        Some(match number {
            0 => Self::Exit,
            1 => Self::Write,
            2 => Self::Read,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Seek,
            6 => Self::Stat,
            7 => Self::Getpid,
            8 => Self::Fork,
            9 => Self::Exec,
            10 => Self::Wait,
            11 => Self::Malloc,
            12 => Self::Free,
            13 => Self::Gettime,
            14 => Self::Sleep,
            15 => Self::Readdir,
            16 => Self::Mkdir,
            17 => Self::Rmdir,
            18 => Self::Unlink,
            19 => Self::Mount,
            20 => Self::Umount,
            21 => Self::LoadDriver,
            22 => Self::Ioctl,
            23 => Self::Getcwd,
            24 => Self::Chdir,
            25 => Self::Kill,
            26 => Self::Getprocs,
            _ => return None,
        })
    }
}

/// gettime がユーザーへ返すレコード
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TimeInfo {
    pub seconds: u32,
    pub milliseconds: u32,
    pub ticks: u32,
}

/// syscall ディスパッチャ
///
/// フレームのアキュムレータを番号として引き、引数レジスタを各ブランチで
/// 明示的にマーシャリングする。返り値はアキュムレータへ。
pub fn dispatch(frame: &mut RegisterFrame) {
    let number = frame.eax;
    let (a1, a2, a3) = (frame.ebx, frame.ecx, frame.edx);

    let ret = match Syscall::from_number(number) {
        None => {
            debug_println!("[SYSCALL] invalid syscall number {}", number);
            -1
        }
        Some(call) => match call {
            Syscall::Exit => sys_exit(a1 as i32),
            Syscall::Write => sys_write(a1, a2, a3),
            Syscall::Read => sys_read(a1, a2, a3),
            Syscall::Open => sys_open(a1, a2),
            Syscall::Close => sys_close(a1),
            Syscall::Seek => sys_seek(a1, a2 as i32, a3),
            Syscall::Stat => sys_stat(a1, a2),
            Syscall::Getpid => sys_getpid(),
            Syscall::Fork => sys_fork(frame),
            Syscall::Exec => sys_exec(a1, a2),
            Syscall::Wait => sys_wait(a1),
            Syscall::Malloc => sys_malloc(a1),
            Syscall::Free => sys_free(a1),
            Syscall::Gettime => sys_gettime(a1),
            Syscall::Sleep => sys_sleep(a1),
            Syscall::Readdir => sys_readdir(a1, a2),
            Syscall::Mkdir => sys_mkdir(a1),
            Syscall::Rmdir => sys_rmdir(a1),
            Syscall::Unlink => sys_unlink(a1),
            Syscall::Mount => sys_mount(a1, a2, a3),
            Syscall::Umount => sys_umount(a1),
            Syscall::LoadDriver => sys_load_driver(a1),
            Syscall::Ioctl => sys_ioctl(a1, a2, a3),
            Syscall::Getcwd => sys_getcwd(a1, a2),
            Syscall::Chdir => sys_chdir(a1),
            Syscall::Kill => sys_kill(a1, a2),
            Syscall::Getprocs => sys_getprocs(a1, a2),
        },
    };

    frame.eax = ret as u32;
}

// ---- ユーザーメモリアクセス ----
//
// syscall はユーザー空間のアドレス空間がアクティブなまま入ってくるので、
// 検査済みポインタは直接参照できる。非 x86 ビルド（ホストテスト）では
// ポインタ引数を取る経路は常に失敗する。

fn user_slice(ptr: u32, len: u32) -> Option<&'static [u8]> {
    if ptr == 0 {
        return None;
    }
    #[cfg(target_arch = "x86")]
    // SAFETY: ヌル検査済み。対象空間はアクティブで、不正アドレスは
    // ページフォルトとして顕在化する
    return Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) });
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = len;
        return None;
    }
}

fn user_slice_mut(ptr: u32, len: u32) -> Option<&'static mut [u8]> {
    if ptr == 0 {
        return None;
    }
    #[cfg(target_arch = "x86")]
    // SAFETY: ヌル検査済み
    return Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) });
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = len;
        return None;
    }
}

fn user_ref<T>(ptr: u32) -> Option<&'static mut T> {
    if ptr == 0 || ptr as usize % core::mem::align_of::<T>() != 0 {
        return None;
    }
    #[cfg(target_arch = "x86")]
    // SAFETY: ヌルとアラインメントは検査済み
    return Some(unsafe { &mut *(ptr as *mut T) });
    #[cfg(not(target_arch = "x86"))]
    return None;
}

/// NUL 終端のユーザー文字列を読む（上限 4096 バイト）
fn user_str(ptr: u32) -> Option<&'static str> {
    if ptr == 0 {
        return None;
    }
    #[cfg(target_arch = "x86")]
    {
        const MAX_LEN: usize = 4096;
        // SAFETY: ヌル検査済み。終端探索は上限付き
        unsafe {
            let base = ptr as *const u8;
            let mut len = 0;
            while len < MAX_LEN && base.add(len).read() != 0 {
                len += 1;
            }
            return core::str::from_utf8(core::slice::from_raw_parts(base, len)).ok();
        }
    }
    #[cfg(not(target_arch = "x86"))]
    return None;
}

/// NULL 終端のユーザー argv 配列を読む（上限 16 要素）
fn user_argv(ptr: u32) -> Vec<String> {
    let mut args = Vec::new();
    if ptr == 0 {
        return args;
    }
    #[cfg(target_arch = "x86")]
    {
        const MAX_ARGS: usize = 16;
        for i in 0..MAX_ARGS {
            // SAFETY: ヌル検査済みの配列を NULL 終端まで読む
            let entry = unsafe { (ptr as *const u32).add(i).read() };
            if entry == 0 {
                break;
            }
            match user_str(entry) {
                Some(s) => args.push(String::from(s)),
                None => break,
            }
        }
    }
    args
}

/// カレントディレクトリと結合した正規形絶対パスを作る
fn absolute_path(raw: &str) -> String {
    let cwd = PROCESS_TABLE
        .lock()
        .current()
        .map(|p| p.cwd.clone())
        .unwrap_or_else(|| String::from("/"));
    crate::kernel::fs::path::join(&cwd, raw)
}

// ---- プロセス ----

fn sys_exit(code: i32) -> i32 {
    let pid = process::current_pid();
    if lifecycle::terminate(pid, code).is_err() {
        return -1;
    }
    process::schedule_next();
    // ここに戻るのは他に走るものが無いときだけ
    #[cfg(target_arch = "x86")]
    crate::hlt_loop();
    #[cfg(not(target_arch = "x86"))]
    return 0;
}

fn sys_getpid() -> i32 {
    process::current_pid().as_u32() as i32
}

fn sys_fork(frame: &RegisterFrame) -> i32 {
    match lifecycle::fork(frame) {
        Ok(child) => child.as_u32() as i32,
        Err(_) => -1,
    }
}

fn sys_exec(path_ptr: u32, argv_ptr: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    let path = absolute_path(raw_path);

    let image = match read_all(&path) {
        Ok(image) => image,
        Err(_) => return -1,
    };

    let argv_strings = user_argv(argv_ptr);
    let mut argv: Vec<&str> = argv_strings.iter().map(String::as_str).collect();
    if argv.is_empty() {
        argv.push(&path);
    }

    if lifecycle::exec_current(&image, &argv).is_err() {
        return -1;
    }

    // 成功したら新イメージに直接突入する (戻らない)
    #[cfg(target_arch = "x86")]
    {
        let entry_frame = {
            let table = PROCESS_TABLE.lock();
            let current = table.current().expect("exec without current process");
            if let Some(space) = &current.space {
                space.activate();
            }
            current.user_frame
        };
        // SAFETY: exec_current が組み立てた有効なユーザー状態で、
        // 直前に対象空間をアクティブにした
        unsafe { crate::arch::x86::context::enter_user_frame(&entry_frame) }
    }
    #[cfg(not(target_arch = "x86"))]
    return 0;
}

fn sys_wait(status_ptr: u32) -> i32 {
    let parent = process::current_pid();
    loop {
        match lifecycle::wait_scan(parent) {
            lifecycle::WaitOutcome::Reaped { pid, code } => {
                if status_ptr != 0 {
                    if let Some(status) = user_ref::<i32>(status_ptr) {
                        *status = code;
                    }
                }
                return pid.as_u32() as i32;
            }
            lifecycle::WaitOutcome::NoChildren => return -1,
            lifecycle::WaitOutcome::WouldBlock => {
                // 実際に停止し、子の exit で起こされてから再スキャンする
                {
                    let mut table = PROCESS_TABLE.lock();
                    if let Some(current) = table.current_mut() {
                        current.set_state(ProcessState::Blocked);
                    }
                }
                process::schedule_next();
                // 切り替え先が無いまま戻ったら割り込みを待つ
                #[cfg(target_arch = "x86")]
                {
                    use crate::arch::{ArchCpu, Cpu};
                    ArchCpu::enable_interrupts();
                    ArchCpu::halt();
                }
                #[cfg(not(target_arch = "x86"))]
                return -1;
            }
        }
    }
}

fn sys_kill(pid: u32, signal: u32) -> i32 {
    let target = Pid::new(pid);
    if lifecycle::kill(target, signal).is_err() {
        return -1;
    }
    if target == process::current_pid() {
        process::schedule_next();
    }
    0
}

fn sys_getprocs(buf_ptr: u32, max_count: u32) -> i32 {
    if buf_ptr == 0 || max_count == 0 {
        return -1;
    }
    let snapshot = process::process_snapshot();
    let count = snapshot.len().min(max_count as usize);
    #[cfg(target_arch = "x86")]
    {
        use crate::kernel::process::ProcInfo;
        // SAFETY: ヌル検査済みのユーザーバッファへ count 件書く
        let out = unsafe {
            core::slice::from_raw_parts_mut(buf_ptr as *mut ProcInfo, count)
        };
        out.copy_from_slice(&snapshot[..count]);
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = &snapshot;
    count as i32
}

// ---- ファイル I/O ----

/// ノードの中身を全部読む (exec 用)
fn read_all(path: &str) -> crate::kernel::core::KernelResult<Vec<u8>> {
    let node = vfs::resolve(path)?;
    let mut data = alloc::vec![0u8; node.length as usize];
    let mut pos = 0usize;
    while pos < data.len() {
        let n = node.read(pos as u32, &mut data[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    data.truncate(pos);
    Ok(data)
}

fn sys_write(fd: u32, buf: u32, len: u32) -> i32 {
    // fd 1/2 はコンソールへ短絡
    if fd == 1 || fd == 2 {
        let Some(bytes) = user_slice(buf, len) else {
            return -1;
        };
        let mut console = driver::console::CONSOLE.lock();
        for &byte in bytes {
            console.put_byte(byte);
        }
        return len as i32;
    }
    if fd >= DEV_FD_BASE {
        let Some(bytes) = user_slice(buf, len) else {
            return -1;
        };
        return match driver::dev_write((fd - DEV_FD_BASE) as usize, bytes) {
            Ok(n) => n as i32,
            Err(_) => -1,
        };
    }

    let Some(bytes) = user_slice(buf, len) else {
        return -1;
    };
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    match vfs::write(&mut current.fds, fd as usize, bytes) {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn sys_read(fd: u32, buf: u32, len: u32) -> i32 {
    // fd 0 はキーボードから 1 行（コンソールにエコーされる）
    if fd == 0 {
        let Some(bytes) = user_slice_mut(buf, len) else {
            return -1;
        };
        return keyboard::read_line(bytes) as i32;
    }
    if fd == 1 || fd == 2 {
        return -1;
    }
    if fd >= DEV_FD_BASE {
        let Some(bytes) = user_slice_mut(buf, len) else {
            return -1;
        };
        return match driver::dev_read((fd - DEV_FD_BASE) as usize, bytes) {
            Ok(n) => n as i32,
            Err(_) => -1,
        };
    }

    let Some(bytes) = user_slice_mut(buf, len) else {
        return -1;
    };
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    match vfs::read(&mut current.fds, fd as usize, bytes) {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn sys_open(path_ptr: u32, flags: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    let path = absolute_path(raw_path);

    // デバイス名はハンドルプールへ
    if path.starts_with("/dev/") {
        return match driver::dev_open(&path, flags) {
            Ok(handle) => (DEV_FD_BASE + handle as u32) as i32,
            Err(_) => -1,
        };
    }

    let flags = OpenFlags::from_bits_truncate(flags);
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    match vfs::open(&mut current.fds, &path, flags) {
        Ok(fd) => fd as i32,
        Err(_) => -1,
    }
}

fn sys_close(fd: u32) -> i32 {
    if fd >= DEV_FD_BASE {
        return match driver::dev_close((fd - DEV_FD_BASE) as usize) {
            Ok(()) => 0,
            Err(_) => -1,
        };
    }
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    match vfs::close(&mut current.fds, fd as usize) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_seek(fd: u32, offset: i32, whence: u32) -> i32 {
    if fd >= DEV_FD_BASE {
        return match driver::dev_seek((fd - DEV_FD_BASE) as usize, offset, whence) {
            Ok(pos) => pos as i32,
            Err(_) => -1,
        };
    }
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    match vfs::seek(&mut current.fds, fd as usize, offset, whence) {
        Ok(pos) => pos as i32,
        Err(_) => -1,
    }
}

fn sys_stat(path_ptr: u32, stat_ptr: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    let Some(out) = user_ref::<Stat>(stat_ptr) else {
        return -1;
    };
    let path = absolute_path(raw_path);
    match vfs::stat(&path, out) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_readdir(fd: u32, entry_ptr: u32) -> i32 {
    let Some(entry) = user_ref::<Dirent>(entry_ptr) else {
        return -1;
    };
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    match vfs::readdir(&mut current.fds, fd as usize, entry) {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn sys_mkdir(path_ptr: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    match vfs::mkdir(&absolute_path(raw_path)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_rmdir(path_ptr: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    match vfs::rmdir(&absolute_path(raw_path)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_unlink(path_ptr: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    match vfs::unlink(&absolute_path(raw_path)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_mount(source_ptr: u32, target_ptr: u32, fstype_ptr: u32) -> i32 {
    let (Some(source), Some(target), Some(fstype)) = (
        user_str(source_ptr),
        user_str(target_ptr),
        user_str(fstype_ptr),
    ) else {
        return -1;
    };
    match vfs::mount(source, target, fstype) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_umount(target_ptr: u32) -> i32 {
    let Some(target) = user_str(target_ptr) else {
        return -1;
    };
    match vfs::unmount(target) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_getcwd(buf_ptr: u32, size: u32) -> i32 {
    let cwd = {
        let table = PROCESS_TABLE.lock();
        match table.current() {
            Some(p) => p.cwd.clone(),
            None => return -1,
        }
    };
    if cwd.len() + 1 > size as usize {
        return -1;
    }
    let Some(out) = user_slice_mut(buf_ptr, size) else {
        return -1;
    };
    out[..cwd.len()].copy_from_slice(cwd.as_bytes());
    out[cwd.len()] = 0;
    cwd.len() as i32
}

fn sys_chdir(path_ptr: u32) -> i32 {
    let Some(raw_path) = user_str(path_ptr) else {
        return -1;
    };
    let path = absolute_path(raw_path);
    let node = match vfs::resolve(&path) {
        Ok(node) => node,
        Err(_) => return -1,
    };
    if node.kind != crate::kernel::fs::NodeKind::Directory {
        return -1;
    }
    let mut table = PROCESS_TABLE.lock();
    let Some(current) = table.current_mut() else {
        return -1;
    };
    current.cwd = path;
    0
}

// ---- メモリ・時間・デバイス ----

fn sys_malloc(size: u32) -> i32 {
    if size == 0 {
        return -1;
    }
    kmalloc(size as usize) as usize as i32
}

fn sys_free(ptr: u32) -> i32 {
    if ptr == 0 {
        return -1;
    }
    kfree(ptr as usize as *mut u8);
    0
}

fn sys_gettime(buf_ptr: u32) -> i32 {
    let Some(out) = user_ref::<TimeInfo>(buf_ptr) else {
        return -1;
    };
    let ms = pit::uptime_ms();
    *out = TimeInfo {
        seconds: ms / 1000,
        milliseconds: ms,
        ticks: pit::ticks(),
    };
    0
}

fn sys_sleep(ms: u32) -> i32 {
    pit::sleep_ms(ms);
    0
}

fn sys_load_driver(path_ptr: u32) -> i32 {
    let Some(path) = user_str(path_ptr) else {
        return -1;
    };
    match driver::driver_load_from_file(path) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_ioctl(fd: u32, cmd: u32, arg: u32) -> i32 {
    if fd < DEV_FD_BASE {
        return -1;
    }
    match driver::dev_ioctl((fd - DEV_FD_BASE) as usize, cmd, arg) {
        Ok(value) => value,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::test_support::{reset, PROC_TEST_LOCK};

    fn call(number: u32, a1: u32, a2: u32, a3: u32) -> i32 {
        let mut frame = RegisterFrame::zeroed();
        frame.eax = number;
        frame.ebx = a1;
        frame.ecx = a2;
        frame.edx = a3;
        dispatch(&mut frame);
        frame.eax as i32
    }

    #[test]
    fn number_table_is_stable() {
        assert_eq!(Syscall::from_number(0), Some(Syscall::Exit));
        assert_eq!(Syscall::from_number(1), Some(Syscall::Write));
        assert_eq!(Syscall::from_number(8), Some(Syscall::Fork));
        assert_eq!(Syscall::from_number(13), Some(Syscall::Gettime));
        assert_eq!(Syscall::from_number(19), Some(Syscall::Mount));
        assert_eq!(Syscall::from_number(25), Some(Syscall::Kill));
        assert_eq!(Syscall::from_number(26), Some(Syscall::Getprocs));
        assert_eq!(Syscall::from_number(27), None);
        assert_eq!(Syscall::from_number(0x80), None);
    }

    #[test]
    fn unknown_number_returns_minus_one() {
        let _guard = PROC_TEST_LOCK.lock();
        reset(64);
        assert_eq!(call(27, 0, 0, 0), -1);
        assert_eq!(call(9999, 1, 2, 3), -1);
    }

    #[test]
    fn null_pointer_arguments_fail() {
        let _guard = PROC_TEST_LOCK.lock();
        reset(64);
        assert_eq!(call(3, 0, 0, 0), -1); // open(NULL)
        assert_eq!(call(6, 0, 0, 0), -1); // stat(NULL, ...)
        assert_eq!(call(1, 1, 0, 4), -1); // write(1, NULL, 4)
        assert_eq!(call(13, 0, 0, 0), -1); // gettime(NULL)
        assert_eq!(call(26, 0, 8, 0), -1); // getprocs(NULL, 8)
    }

    #[test]
    fn getpid_and_kill_guard() {
        let _guard = PROC_TEST_LOCK.lock();
        reset(64);
        // ブート直後の current はカーネル (pid 0)
        assert_eq!(call(7, 0, 0, 0), 0);
        // pid 0 は kill できない
        assert_eq!(call(25, 0, 9, 0), -1);
        // 存在しない pid も -1
        assert_eq!(call(25, 42, 9, 0), -1);
    }

    #[test]
    fn sleep_zero_returns_immediately() {
        let _guard = PROC_TEST_LOCK.lock();
        reset(64);
        assert_eq!(call(14, 0, 0, 0), 0);
    }

    #[test]
    fn ioctl_requires_device_fd() {
        let _guard = PROC_TEST_LOCK.lock();
        reset(64);
        assert_eq!(call(22, 3, 0, 0), -1);
    }
}
