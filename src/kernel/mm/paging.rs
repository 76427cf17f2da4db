// src/kernel/mm/paging.rs
//! 2 段ページテーブルの仮想メモリ管理
//!
//! ページディレクトリ (1024 エントリ) が各 1024 エントリのページテーブルを
//! 指す i686 の標準構成。下位半分 (PDE 0..512) はカーネル領域で全アドレス
//! 空間に参照共有され、上位半分がプロセス毎のユーザー領域。
//!
//! テーブルへのアクセスはすべて物理ウィンドウ (`types::phys_to_ptr`)
//! 経由で行う。実機ではウィンドウは 0（アイデンティティマップ）。

use crate::arch::x86::flush_tlb;
use crate::debug_println;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::frame::FrameAllocator;
use crate::kernel::mm::types::{phys_to_ptr, PhysAddr, VirtAddr};
use crate::kernel::mm::{is_user_address, PAGE_SIZE};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// ページエントリのフラグビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
    }
}

/// ディレクトリ・テーブルのエントリ数
const ENTRY_COUNT: usize = 1024;
/// エントリ下位のフラグ部
const FLAGS_MASK: u32 = 0xFFF;
/// ユーザー領域が始まるディレクトリインデックス
const USER_PDE_START: usize = 512;

/// カーネルページディレクトリの物理アドレス
///
/// `init_kernel_space` が設定し、以後すべての `AddressSpace::create` が
/// ここからカーネル側 PDE をコピーする。
static KERNEL_DIRECTORY: AtomicU32 = AtomicU32::new(0);

#[inline]
fn table_ptr(table: PhysAddr) -> *mut u32 {
    phys_to_ptr(table).cast::<u32>()
}

#[inline]
fn zero_frame(frame: PhysAddr) {
    // SAFETY: 呼び出し元はアロケータから得た 4 KiB フレームを渡す
    unsafe {
        core::ptr::write_bytes(phys_to_ptr(frame), 0, PAGE_SIZE);
    }
}

/// 1 プロセス分のアドレス空間
///
/// ページディレクトリ 1 枚と、遅延割り当てされるページテーブル群を所有する。
/// ユーザー領域のフレームは `destroy` でアロケータに返される。
#[derive(Debug)]
pub struct AddressSpace {
    directory: PhysAddr,
}

impl AddressSpace {
    /// 新しいアドレス空間を作成
    ///
    /// ディレクトリを確保してゼロ初期化し、カーネル領域の PDE を共有コピー
    /// する（カーネルディレクトリが未設定の早期ブートではコピーを省く）。
    pub fn create(frames: &mut FrameAllocator) -> KernelResult<Self> {
        let directory = frames.alloc();
        if directory.is_null() {
            return Err(KernelError::with_context(
                ErrorKind::Exhausted,
                "page directory frame",
            ));
        }
        zero_frame(directory);

        let kernel_dir = KERNEL_DIRECTORY.load(Ordering::Acquire);
        if kernel_dir != 0 {
            let src = table_ptr(PhysAddr::new(kernel_dir));
            let dst = table_ptr(directory);
            // SAFETY: 両者ともゼロ初期化済みの 1024 エントリテーブル
            unsafe {
                core::ptr::copy_nonoverlapping(src, dst, USER_PDE_START);
            }
        }

        Ok(Self { directory })
    }

    /// ディレクトリの物理アドレス
    #[must_use]
    pub const fn directory_phys(&self) -> PhysAddr {
        self.directory
    }

    /// 仮想アドレスに対応する PTE へのポインタを得る
    ///
    /// `create` が真なら中間テーブルを割り当てる。
    fn entry_ptr(
        &self,
        va: VirtAddr,
        create: bool,
        frames: &mut FrameAllocator,
    ) -> Option<*mut u32> {
        let dir = table_ptr(self.directory);
        // SAFETY: directory は自身が所有する有効なテーブルフレーム
        let pde = unsafe { dir.add(va.directory_index()) };
        // SAFETY: pde はテーブル内を指す
        let pde_value = unsafe { pde.read() };

        let table = if pde_value & PageFlags::PRESENT.bits() != 0 {
            PhysAddr::new(pde_value & !FLAGS_MASK)
        } else {
            if !create {
                return None;
            }
            let table = frames.alloc();
            if table.is_null() {
                debug_println!("[VMM] out of frames for page table");
                return None;
            }
            zero_frame(table);
            let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
            if va.directory_index() >= USER_PDE_START {
                flags |= PageFlags::USER;
            }
            // SAFETY: pde はテーブル内を指す
            unsafe {
                pde.write(table.as_u32() | flags.bits());
            }
            table
        };

        // SAFETY: table は有効な 1024 エントリのページテーブル
        Some(unsafe { table_ptr(table).add(va.table_index()) })
    }

    /// 仮想ページを物理フレームへマップする
    ///
    /// 中間テーブルが無ければ割り当て、エントリ書き込み後に対象 TLB を
    /// 無効化する。
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let entry = self
            .entry_ptr(va, true, frames)
            .ok_or(KernelError::with_context(
                ErrorKind::Exhausted,
                "page table frame",
            ))?;
        // SAFETY: entry_ptr は有効な PTE を返す
        unsafe {
            entry.write(pa.page_base().as_u32() | (flags | PageFlags::PRESENT).bits());
        }
        flush_tlb(va.as_u32());
        Ok(())
    }

    /// 仮想ページのマップを解除する
    ///
    /// ユーザー領域の場合はバッキングフレームをアロケータへ返す。
    /// カーネルのアイデンティティマップはここでは解放しない。
    pub fn unmap(&mut self, frames: &mut FrameAllocator, va: VirtAddr) {
        let Some(entry) = self.entry_ptr(va, false, frames) else {
            return;
        };
        // SAFETY: entry_ptr は有効な PTE を返す
        let value = unsafe { entry.read() };
        if value & PageFlags::PRESENT.bits() == 0 {
            return;
        }
        if is_user_address(va.as_u32()) {
            frames.free(PhysAddr::new(value & !FLAGS_MASK));
        }
        // SAFETY: entry_ptr は有効な PTE を返す
        unsafe {
            entry.write(0);
        }
        flush_tlb(va.as_u32());
    }

    /// 仮想アドレスを物理アドレスへ変換する
    ///
    /// マップされていなければ番兵 (ヌル) を返す。
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> PhysAddr {
        let dir = table_ptr(self.directory);
        // SAFETY: directory は有効なテーブルフレーム
        let pde_value = unsafe { dir.add(va.directory_index()).read() };
        if pde_value & PageFlags::PRESENT.bits() == 0 {
            return PhysAddr::NULL;
        }
        let table = PhysAddr::new(pde_value & !FLAGS_MASK);
        // SAFETY: PRESENT な PDE は有効なテーブルを指す
        let pte_value = unsafe { table_ptr(table).add(va.table_index()).read() };
        if pte_value & PageFlags::PRESENT.bits() == 0 {
            return PhysAddr::NULL;
        }
        PhysAddr::new((pte_value & !FLAGS_MASK) | va.page_offset())
    }

    /// アドレス空間をディープコピーする (fork の意味論的基盤)
    ///
    /// ユーザー領域の PRESENT なエントリごとに新しいフレームを確保して
    /// 4 KiB の内容をコピーし、フラグは引き継ぐ。途中でフレームが尽きた
    /// 場合は作りかけの空間を解体して失敗を返す。
    pub fn clone_from(src: &Self, frames: &mut FrameAllocator) -> KernelResult<Self> {
        let mut clone = Self::create(frames)?;

        let src_dir = table_ptr(src.directory);
        for dir_idx in USER_PDE_START..ENTRY_COUNT {
            // SAFETY: directory は有効なテーブルフレーム
            let pde_value = unsafe { src_dir.add(dir_idx).read() };
            if pde_value & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let src_table = PhysAddr::new(pde_value & !FLAGS_MASK);

            for tbl_idx in 0..ENTRY_COUNT {
                // SAFETY: PRESENT な PDE は有効なテーブルを指す
                let pte_value = unsafe { table_ptr(src_table).add(tbl_idx).read() };
                if pte_value & PageFlags::PRESENT.bits() == 0 {
                    continue;
                }

                let new_frame = frames.alloc();
                if new_frame.is_null() {
                    clone.destroy(frames);
                    return Err(KernelError::with_context(
                        ErrorKind::Exhausted,
                        "clone frame",
                    ));
                }

                let src_frame = PhysAddr::new(pte_value & !FLAGS_MASK);
                // SAFETY: 双方ともアロケータ管理下の 4 KiB フレーム
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        phys_to_ptr(src_frame),
                        phys_to_ptr(new_frame),
                        PAGE_SIZE,
                    );
                }

                let va = VirtAddr::new(((dir_idx as u32) << 22) | ((tbl_idx as u32) << 12));
                let flags = PageFlags::from_bits_truncate(pte_value & FLAGS_MASK);
                if let Err(e) = clone.map(frames, va, new_frame, flags) {
                    frames.free(new_frame);
                    clone.destroy(frames);
                    return Err(e);
                }
            }
        }

        Ok(clone)
    }

    /// アドレス空間を解体し、ユーザー領域の全フレームを返却する
    pub fn destroy(&mut self, frames: &mut FrameAllocator) {
        let dir = table_ptr(self.directory);
        for dir_idx in USER_PDE_START..ENTRY_COUNT {
            // SAFETY: directory は有効なテーブルフレーム
            let pde_value = unsafe { dir.add(dir_idx).read() };
            if pde_value & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table = PhysAddr::new(pde_value & !FLAGS_MASK);
            for tbl_idx in 0..ENTRY_COUNT {
                // SAFETY: PRESENT な PDE は有効なテーブルを指す
                let pte_value = unsafe { table_ptr(table).add(tbl_idx).read() };
                if pte_value & PageFlags::PRESENT.bits() != 0 {
                    frames.free(PhysAddr::new(pte_value & !FLAGS_MASK));
                }
            }
            frames.free(table);
            // SAFETY: directory は有効なテーブルフレーム
            unsafe {
                dir.add(dir_idx).write(0);
            }
        }
        frames.free(self.directory);
        self.directory = PhysAddr::NULL;
    }

    /// この空間をアクティブにする (CR3 ロード)
    pub fn activate(&self) {
        // SAFETY: directory は有効でカーネル領域をマップ済み
        unsafe {
            crate::arch::x86::load_page_directory(self.directory.as_u32());
        }
    }

    /// マップ済み領域へバイト列を書き込む
    ///
    /// 対象空間がアクティブでなくても物理ウィンドウ経由で書ける。
    /// 未マップページに当たると `InvalidArgument`。
    pub fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        let mut addr = u64::from(va.as_u32());
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let page_off = (addr & 0xFFF) as usize;
            let chunk = remaining.len().min(PAGE_SIZE - page_off);
            let pa = self.translate(VirtAddr::new(addr as u32));
            if pa.is_null() {
                return Err(KernelError::with_context(
                    ErrorKind::InvalidArgument,
                    "write to unmapped page",
                ));
            }
            // SAFETY: translate が返した先はマップ済みフレーム
            unsafe {
                core::ptr::copy_nonoverlapping(remaining.as_ptr(), phys_to_ptr(pa), chunk);
            }
            remaining = &remaining[chunk..];
            addr += chunk as u64;
        }
        Ok(())
    }

    /// マップ済み領域をゼロで埋める
    pub fn zero_range(&self, va: VirtAddr, len: usize) -> KernelResult<()> {
        let mut addr = u64::from(va.as_u32());
        let mut remaining = len;
        while remaining > 0 {
            let page_off = (addr & 0xFFF) as usize;
            let chunk = remaining.min(PAGE_SIZE - page_off);
            let pa = self.translate(VirtAddr::new(addr as u32));
            if pa.is_null() {
                return Err(KernelError::with_context(
                    ErrorKind::InvalidArgument,
                    "zero of unmapped page",
                ));
            }
            // SAFETY: translate が返した先はマップ済みフレーム
            unsafe {
                core::ptr::write_bytes(phys_to_ptr(pa), 0, chunk);
            }
            remaining -= chunk;
            addr += chunk as u64;
        }
        Ok(())
    }
}

/// カーネルアドレス空間を構築してページングを有効化する
///
/// 管理下の全物理メモリをアイデンティティマップし（最低でも先頭 8 MiB を
/// 覆う）、CR3 をロードして CR0.PG を立てる。以後のアクセスはすべて
/// 仮想アドレスになるが、アイデンティティマップにより物理ウィンドウ 0 の
/// まま正しさが保たれる。
#[cfg(target_arch = "x86")]
pub fn init_kernel_space(frames: &mut FrameAllocator, identity_limit: u32) -> KernelResult<()> {
    let mut space = AddressSpace::create(frames)?;

    debug_println!(
        "[VMM] identity mapping 0x00000000 - {:#010x}",
        identity_limit
    );
    let mut addr: u32 = 0;
    while addr < identity_limit {
        space.map(
            frames,
            VirtAddr::new(addr),
            PhysAddr::new(addr),
            PageFlags::WRITABLE,
        )?;
        addr += PAGE_SIZE as u32;
    }

    KERNEL_DIRECTORY.store(space.directory_phys().as_u32(), Ordering::Release);
    space.activate();
    // SAFETY: CR3 ロード済みで実行中コードはアイデンティティマップ内
    unsafe {
        crate::arch::x86::enable_paging();
    }
    debug_println!("[VMM] paging enabled");

    // カーネルディレクトリは解体しないので忘れてよい
    core::mem::forget(space);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mm::test_support::phys_arena;

    const VA: u32 = 0x8010_0000;

    #[test]
    fn map_then_translate_roundtrip() {
        let mut frames = phys_arena(64);
        let mut space = AddressSpace::create(&mut frames).unwrap();

        let frame = frames.alloc();
        space
            .map(
                &mut frames,
                VirtAddr::new(VA),
                frame,
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();

        assert_eq!(space.translate(VirtAddr::new(VA)), frame);
        assert_eq!(
            space.translate(VirtAddr::new(VA + 0x123)).as_u32(),
            frame.as_u32() + 0x123
        );

        space.unmap(&mut frames, VirtAddr::new(VA));
        assert!(space.translate(VirtAddr::new(VA)).is_null());
        space.destroy(&mut frames);
    }

    #[test]
    fn unmap_returns_user_frame_to_allocator() {
        let mut frames = phys_arena(16);
        let mut space = AddressSpace::create(&mut frames).unwrap();

        let frame = frames.alloc();
        space
            .map(
                &mut frames,
                VirtAddr::new(VA),
                frame,
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();
        assert!(frames.is_allocated(frame));
        space.unmap(&mut frames, VirtAddr::new(VA));
        assert!(!frames.is_allocated(frame));
        space.destroy(&mut frames);
    }

    #[test]
    fn clone_copies_contents_into_distinct_frames() {
        let mut frames = phys_arena(64);
        let mut space = AddressSpace::create(&mut frames).unwrap();

        let frame = frames.alloc();
        space
            .map(
                &mut frames,
                VirtAddr::new(VA),
                frame,
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();
        space.write_bytes(VirtAddr::new(VA), b"fork me").unwrap();

        let clone = AddressSpace::clone_from(&space, &mut frames).unwrap();
        let cloned_pa = clone.translate(VirtAddr::new(VA));
        assert!(!cloned_pa.is_null());
        assert_ne!(cloned_pa, frame);

        // SAFETY: 双方ともテストアリーナ内のマップ済みフレーム
        let (src, dst) = unsafe {
            (
                core::slice::from_raw_parts(phys_to_ptr(frame), PAGE_SIZE),
                core::slice::from_raw_parts(phys_to_ptr(cloned_pa.page_base()), PAGE_SIZE),
            )
        };
        assert_eq!(src, dst);

        let mut clone = clone;
        clone.destroy(&mut frames);
        space.destroy(&mut frames);
    }

    #[test]
    fn clone_isolation_after_write() {
        // fork 後の書き込みが親に見えないこと
        let mut frames = phys_arena(64);
        let mut space = AddressSpace::create(&mut frames).unwrap();

        let frame = frames.alloc();
        space
            .map(
                &mut frames,
                VirtAddr::new(VA),
                frame,
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();
        space.write_bytes(VirtAddr::new(VA), &[0xAA]).unwrap();

        let clone = AddressSpace::clone_from(&space, &mut frames).unwrap();
        clone.write_bytes(VirtAddr::new(VA), &[0x55]).unwrap();

        let parent_pa = space.translate(VirtAddr::new(VA));
        // SAFETY: マップ済みフレーム
        let parent_byte = unsafe { phys_to_ptr(parent_pa).read() };
        assert_eq!(parent_byte, 0xAA);

        let mut clone = clone;
        clone.destroy(&mut frames);
        space.destroy(&mut frames);
    }

    #[test]
    fn destroy_returns_every_user_frame() {
        let mut frames = phys_arena(64);
        let baseline = frames.used_frames();
        let mut space = AddressSpace::create(&mut frames).unwrap();
        for i in 0..4u32 {
            let frame = frames.alloc();
            space
                .map(
                    &mut frames,
                    VirtAddr::new(VA + i * PAGE_SIZE as u32),
                    frame,
                    PageFlags::WRITABLE | PageFlags::USER,
                )
                .unwrap();
        }
        assert!(frames.used_frames() > baseline);
        space.destroy(&mut frames);
        assert_eq!(frames.used_frames(), baseline);
    }
}
