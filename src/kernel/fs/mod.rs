// src/kernel/fs/mod.rs
//! Virtual File System
//!
//! ノード抽象・マウントテーブル・プロセス毎のファイルディスクリプタ表を
//! 提供します。ノードは自分のファイルシステムの操作 vtable
//! ([`NodeOps`]) への参照を持ち、能力が無い操作は `Unsupported` で
//! 失敗します。ノードは参照カウントされず、寿命はそのファイルシステムの
//! マウントと一致します。

pub mod initrd;
pub mod path;
pub mod vfs;

use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// open(2) 相当のフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x1;
        const WRONLY = 0x2;
        const RDWR   = 0x4;
        const CREAT  = 0x8;
        const TRUNC  = 0x10;
        const APPEND = 0x20;
    }
}

/// seek の whence 値
pub const SEEK_SET: u32 = 0;
/// 現在位置からの相対
pub const SEEK_CUR: u32 = 1;
/// 終端からの相対
pub const SEEK_END: u32 = 2;

/// ノード種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// 通常ファイル
    Regular,
    /// ディレクトリ
    Directory,
    /// キャラクタデバイス
    CharDevice,
    /// ブロックデバイス
    BlockDevice,
    /// シンボリックリンク
    Symlink,
    /// マウントポイント
    MountPoint,
}

impl NodeKind {
    /// stat の mode に入るファイル種別ビット
    #[must_use]
    pub const fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => 0x8000,
            Self::Directory | Self::MountPoint => 0x4000,
            Self::CharDevice => 0x2000,
            Self::BlockDevice => 0x6000,
            Self::Symlink => 0xA000,
        }
    }
}

/// VFS ノード
///
/// `handle` はファイルシステム実装定義の値（initrd ではファイル索引）。
pub struct VfsNode {
    /// ノード名（パス要素）
    pub name: String,
    /// 種別
    pub kind: NodeKind,
    /// バイト長（ディレクトリでは 0）
    pub length: u32,
    /// inode 番号
    pub inode: u32,
    /// 実装定義ハンドル
    pub handle: u32,
    ops: Arc<dyn NodeOps>,
}

/// 共有ノード参照
pub type NodeRef = Arc<VfsNode>;

impl VfsNode {
    /// ノードを作成
    #[must_use]
    pub fn new(
        name: String,
        kind: NodeKind,
        length: u32,
        inode: u32,
        handle: u32,
        ops: Arc<dyn NodeOps>,
    ) -> Self {
        Self {
            name,
            kind,
            length,
            inode,
            handle,
            ops,
        }
    }

    /// ノードから読み取る
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> KernelResult<usize> {
        self.ops.read(self, offset, buf)
    }

    /// ノードへ書き込む
    pub fn write(&self, offset: u32, buf: &[u8]) -> KernelResult<usize> {
        self.ops.write(self, offset, buf)
    }

    /// オープンフックを呼ぶ
    pub fn open(&self) -> KernelResult<()> {
        self.ops.open(self)
    }

    /// クローズフックを呼ぶ
    pub fn close(&self) {
        self.ops.close(self);
    }

    /// index 番目の子ノードを得る
    pub fn readdir(&self, index: u32) -> KernelResult<Option<NodeRef>> {
        self.ops.readdir(self, index)
    }

    /// 名前で子ノードを探す
    pub fn finddir(&self, name: &str) -> KernelResult<Option<NodeRef>> {
        self.ops.finddir(self, name)
    }
}

impl core::fmt::Debug for VfsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VfsNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("length", &self.length)
            .field("inode", &self.inode)
            .finish_non_exhaustive()
    }
}

/// ファイルシステム操作の vtable
///
/// 能力集合 {read, write, open, close, readdir, finddir} に対して
/// 多相的。実装されない操作は `Unsupported` で失敗する。
pub trait NodeOps: Send + Sync {
    /// オフセットから読み取り、読んだバイト数を返す
    fn read(&self, node: &VfsNode, offset: u32, buf: &mut [u8]) -> KernelResult<usize> {
        let (_, _, _) = (node, offset, buf);
        Err(KernelError::new(ErrorKind::Unsupported))
    }

    /// オフセットへ書き込み、書いたバイト数を返す
    fn write(&self, node: &VfsNode, offset: u32, buf: &[u8]) -> KernelResult<usize> {
        let (_, _, _) = (node, offset, buf);
        Err(KernelError::new(ErrorKind::Unsupported))
    }

    /// オープン時フック
    fn open(&self, node: &VfsNode) -> KernelResult<()> {
        let _ = node;
        Ok(())
    }

    /// クローズ時フック
    fn close(&self, node: &VfsNode) {
        let _ = node;
    }

    /// index 番目の子（範囲外は `None`）
    fn readdir(&self, node: &VfsNode, index: u32) -> KernelResult<Option<NodeRef>> {
        let (_, _) = (node, index);
        Err(KernelError::new(ErrorKind::Unsupported))
    }

    /// 名前で子を検索（不在は `None`）
    fn finddir(&self, node: &VfsNode, name: &str) -> KernelResult<Option<NodeRef>> {
        let (_, _) = (node, name);
        Err(KernelError::new(ErrorKind::Unsupported))
    }
}

/// readdir がユーザーへ返すディレクトリエントリ
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Dirent {
    /// NUL 終端のエントリ名
    pub name: [u8; 256],
    /// inode 番号
    pub inode: u32,
    /// ファイル種別ビット
    pub kind: u32,
}

impl Dirent {
    /// 空のエントリ
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            name: [0; 256],
            inode: 0,
            kind: 0,
        }
    }

    /// 名前を設定（255 バイトで切り詰め、NUL 終端）
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(255);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len] = 0;
    }

    /// 名前を &str として取得
    #[must_use]
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

impl Default for Dirent {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// stat がユーザーへ返すレコード（時刻はブートからの秒）
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    pub mode: u32,
    pub size: u32,
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// プロセス毎のディスクリプタ表の大きさ
pub const MAX_FDS: usize = 32;
/// 0/1/2 は stdin/stdout/stderr 用に予約
pub const FIRST_USER_FD: usize = 3;

/// オープン中ファイル
#[derive(Clone)]
pub struct OpenFile {
    /// 対象ノード
    pub node: NodeRef,
    /// バイト位置
    pub pos: u32,
    /// オープンフラグ
    pub flags: OpenFlags,
}

/// プロセス毎のファイルディスクリプタ表
///
/// スロットが空 ⇔ ノードが無い。fork では値コピーされ、子の fd は同じ
/// ノードを指す。
#[derive(Clone)]
pub struct FdTable {
    slots: Vec<Option<OpenFile>>,
}

impl FdTable {
    /// 空の表を作成
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_FDS],
        }
    }

    /// 3 以降の空きスロットを割り当てる
    pub fn allocate(&mut self, file: OpenFile) -> KernelResult<usize> {
        for fd in FIRST_USER_FD..MAX_FDS {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(file);
                return Ok(fd);
            }
        }
        Err(KernelError::with_context(ErrorKind::Exhausted, "fd table"))
    }

    /// スロットを参照
    #[must_use]
    pub fn get(&self, fd: usize) -> Option<&OpenFile> {
        self.slots.get(fd).and_then(|s| s.as_ref())
    }

    /// スロットを可変参照
    pub fn get_mut(&mut self, fd: usize) -> Option<&mut OpenFile> {
        self.slots.get_mut(fd).and_then(|s| s.as_mut())
    }

    /// スロットを解放し、入っていたファイルを返す
    pub fn take(&mut self, fd: usize) -> Option<OpenFile> {
        self.slots.get_mut(fd).and_then(|s| s.take())
    }

    /// すべての fd を閉じる (exit 用)
    pub fn close_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(file) = slot.take() {
                file.node.close();
            }
        }
    }

    /// 使用中の fd 数
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
