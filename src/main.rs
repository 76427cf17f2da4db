// src/main.rs
//! カーネルエントリポイント
//!
//! multiboot v1 のハンドオフレコードを受け取り、各サブシステムを
//! 初期化して最初のユーザープロセスを起動します。GDT/TSS はブートスタブ
//! 側でフラットセグメント (カーネル 0x08/0x10、ユーザー 0x1B/0x23) が
//! 設定済みであることを前提とします。

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod boot {
    extern crate alloc;

    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use ember_os::arch::{ArchCpu, Cpu};
    use ember_os::kernel::driver::console::ConsoleDriver;
    use ember_os::kernel::driver::keyboard::KeyboardDriver;
    use ember_os::kernel::driver::{self, keyboard, pit, Driver, DriverKind, DriverState};
    use ember_os::kernel::fs::initrd::InitrdFs;
    use ember_os::kernel::fs::vfs;
    use ember_os::kernel::mm::types::PhysAddr;
    use ember_os::kernel::mm::{self, FRAME_ALLOCATOR};
    use ember_os::kernel::process::{self, lifecycle, Pid, ProcessState, PROCESS_TABLE};
    use ember_os::kernel::scheduler::SCHEDULER;
    use ember_os::kernel::trap;
    use ember_os::{console_println, debug_println, hlt_loop, println};

    /// multiboot v1 マジック
    const MULTIBOOT_MAGIC: u32 = 0x2BAD_B002;

    /// カーネルイメージ + 低位 1 MiB の予約フレーム数 (8 MiB)
    const KERNEL_RESERVED_FRAMES: usize = 2048;

    /// カーネルヒープの物理位置（予約領域内、イメージより上）
    const HEAP_START: usize = 0x0060_0000;

    /// multiboot 情報レコード
    #[repr(C, packed)]
    struct MultibootInfo {
        flags: u32,
        mem_lower: u32,
        mem_upper: u32,
        boot_device: u32,
        cmdline: u32,
        mods_count: u32,
        mods_addr: u32,
    }

    /// multiboot モジュールレコード
    #[repr(C, packed)]
    struct MultibootModule {
        mod_start: u32,
        mod_end: u32,
        string: u32,
        reserved: u32,
    }

    #[unsafe(no_mangle)]
    extern "C" fn kmain(magic: u32, mboot: *const MultibootInfo) -> ! {
        ember_os::kernel::driver::serial::SERIAL1.lock().init();

        console_println!();
        console_println!("========================================");
        console_println!("  ember OS");
        console_println!("  booting...");
        console_println!("========================================");

        if magic != MULTIBOOT_MAGIC {
            console_println!("error: not loaded by a multiboot bootloader");
            hlt_loop();
        }
        // SAFETY: ブートローダが有効なレコードを渡してくる
        let mboot = unsafe { &*mboot };

        println!("[*] interrupts");
        trap::init();
        trap::register_irq_handler(0, pit::irq_handler);
        trap::register_irq_handler(1, keyboard::irq_handler);
        pit::init();

        println!("[*] memory");
        let total_kb = mboot.mem_lower + mboot.mem_upper;
        let total_frames = (total_kb as usize * 1024) / mm::PAGE_SIZE;
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            frames.init(PhysAddr::new(0), total_frames, KERNEL_RESERVED_FRAMES);
            debug_println!(
                "[MM] {} KiB total, {} frames managed",
                total_kb,
                frames.total_frames()
            );
        }

        println!("[*] heap");
        // SAFETY: 予約領域内の専用レンジで、一度だけ呼ばれる
        unsafe {
            ember_os::init_heap(HEAP_START as *mut u8, mm::HEAP_SIZE);
        }

        println!("[*] paging");
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            let identity_limit = (frames.total_frames() * mm::PAGE_SIZE) as u32;
            ember_os::kernel::mm::paging::init_kernel_space(&mut frames, identity_limit)
                .expect("failed to enable paging");
        }

        println!("[*] drivers");
        let _ = driver::driver_register(Driver {
            name: "tty",
            version: 1,
            kind: DriverKind::Char,
            state: DriverState::Unloaded,
            major: 0,
            ops: Arc::new(ConsoleDriver),
        });
        let _ = driver::driver_register(Driver {
            name: "kbd",
            version: 1,
            kind: DriverKind::Char,
            state: DriverState::Unloaded,
            major: 0,
            ops: Arc::new(KeyboardDriver),
        });

        println!("[*] initrd");
        if mboot.mods_count == 0 {
            console_println!("error: no initrd module");
            hlt_loop();
        }
        // SAFETY: モジュールテーブルとその指す領域はブートローダが確保済みで
        // カーネルの生存期間中有効
        let initrd: &'static [u8] = unsafe {
            let module = &*(mboot.mods_addr as *const MultibootModule);
            core::slice::from_raw_parts(
                module.mod_start as *const u8,
                (module.mod_end - module.mod_start) as usize,
            )
        };
        let initrd_fs = InitrdFs::new(initrd);
        debug_println!("[INITRD] {} bytes, {} files", initrd.len(), initrd_fs.file_count());
        vfs::register_filesystem(initrd_fs);
        vfs::mount("initrd0", "/", "initrd").expect("failed to mount root");

        println!("[*] processes");
        process::init();

        console_println!();
        console_println!("boot complete");
        console_println!();

        // initrd の名前空間はフラットなので init はアーカイブ直下に置く
        match spawn_init("/init") {
            Ok(pid) => {
                debug_println!("[BOOT] init is pid {}", pid.as_u32());
            }
            Err(_) => {
                console_println!("error: no /init in initrd; halting");
            }
        }

        // アイドルループ。走れるプロセスがあればタイマが奪っていく
        loop {
            process::schedule_next();
            ArchCpu::enable_interrupts();
            ArchCpu::halt();
        }
    }

    /// initrd から最初のユーザープロセスを立ち上げる
    fn spawn_init(path: &str) -> Result<Pid, ()> {
        let image = read_all(path).map_err(|_| ())?;

        let pid = process::create_process("init").map_err(|_| ())?;
        PROCESS_TABLE.lock().set_current(pid);
        let result = lifecycle::exec_current(&image, &[path]);
        {
            let mut table = PROCESS_TABLE.lock();
            if let Some(init) = table.get_mut(pid) {
                init.set_state(ProcessState::Ready);
            }
            table.set_current(Pid::KERNEL);
        }
        result.map_err(|_| ())?;
        SCHEDULER.lock().add(pid);
        Ok(pid)
    }

    fn read_all(path: &str) -> Result<Vec<u8>, ()> {
        let node = vfs::resolve(path).map_err(|_| ())?;
        let mut data = alloc::vec![0u8; node.length as usize];
        let mut pos = 0usize;
        while pos < data.len() {
            let n = node.read(pos as u32, &mut data[pos..]).map_err(|_| ())?;
            if n == 0 {
                break;
            }
            pos += n;
        }
        data.truncate(pos);
        Ok(data)
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        ArchCpu::disable_interrupts();
        console_println!("\nkernel panic: {}", info);
        debug_println!("[PANIC] {}", info);
        hlt_loop();
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {
    eprintln!("ember_os is a kernel image; build for an i686 target to boot it");
}
