// src/kernel/fs/vfs.rs
//! マウント対応 VFS コア
//!
//! マウントテーブルは最長プレフィックス一致で解決する。`/` は任意のパス
//! に一致し、`/x` は `/x` と `/x/...` に一致するが `/xy` には一致しない。
//! 一致した中でパス長最大のマウントが勝つ。

use crate::debug_println;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::fs::path;
use crate::kernel::fs::{
    Dirent, FdTable, NodeKind, NodeRef, OpenFile, OpenFlags, Stat, SEEK_CUR, SEEK_END, SEEK_SET,
};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// マウントエントリ
pub struct Mount {
    /// 正規形の絶対マウントパス
    pub path: String,
    /// マウントソース（デバイス名など、情報のみ）
    pub source: String,
    /// ファイルシステム種別
    pub fstype: String,
    /// ルートノード
    pub root: NodeRef,
}

/// ファイルシステムファクトリ
///
/// `mount` syscall は fstype 文字列でここに登録された実装へ
/// ディスパッチされる。
pub trait Filesystem: Send + Sync {
    /// fstype 名
    fn fstype(&self) -> &str;

    /// ソースからルートノードを作る
    fn mount(&self, source: &str) -> KernelResult<NodeRef>;

    /// マウント解除時の後始末
    fn unmount(&self, root: &NodeRef) {
        let _ = root;
    }
}

static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());
static FILESYSTEMS: Mutex<Vec<Arc<dyn Filesystem>>> = Mutex::new(Vec::new());

/// ファイルシステム実装を登録する
pub fn register_filesystem(fs: Arc<dyn Filesystem>) {
    debug_println!("[VFS] registered filesystem type '{}'", fs.fstype());
    FILESYSTEMS.lock().push(fs);
}

/// マウントテーブルを空にする（ブート・テスト初期化用）
pub fn clear_mounts() {
    MOUNTS.lock().clear();
}

/// `mount_path` が `path` のディレクトリ境界プレフィックスか
fn prefix_matches(mount_path: &str, path: &str) -> bool {
    if mount_path == "/" {
        return true;
    }
    if let Some(rest) = path.strip_prefix(mount_path) {
        rest.is_empty() || rest.starts_with('/')
    } else {
        false
    }
}

/// 正規化済みパスに対する最長一致マウントを探す
///
/// 戻り値は (ルートノード, マウント配下の残りパス)。
fn find_mount(normalized: &str) -> Option<(NodeRef, String)> {
    let mounts = MOUNTS.lock();
    let mut best: Option<&Mount> = None;
    for mount in mounts.iter() {
        if prefix_matches(&mount.path, normalized) {
            match best {
                Some(b) if b.path.len() >= mount.path.len() => {}
                _ => best = Some(mount),
            }
        }
    }
    best.map(|mount| {
        let rest = if mount.path == "/" {
            normalized
        } else {
            &normalized[mount.path.len()..]
        };
        (mount.root.clone(), String::from(rest))
    })
}

/// 絶対パスをノードに解決する
///
/// 相対パスは拒否する（cwd との結合は syscall 層が先に行う）。
pub fn resolve(raw_path: &str) -> KernelResult<NodeRef> {
    if !path::is_absolute(raw_path) {
        return Err(KernelError::with_context(
            ErrorKind::InvalidArgument,
            "relative path",
        ));
    }
    let normalized = path::normalize(raw_path);
    let (mut current, rest) = find_mount(&normalized).ok_or(KernelError::with_context(
        ErrorKind::NotFound,
        "no filesystem mounted",
    ))?;

    for component in path::components(&rest) {
        current = current
            .finddir(component)?
            .ok_or(KernelError::new(ErrorKind::NotFound))?;
    }
    Ok(current)
}

/// ファイルシステムをマウントする
///
/// 対象パスが既にマウント済みなら `Exists`。fstype に対応する
/// ファクトリが無ければ `NotFound`。
pub fn mount(source: &str, target: &str, fstype: &str) -> KernelResult<()> {
    if !path::is_absolute(target) {
        return Err(KernelError::with_context(
            ErrorKind::InvalidArgument,
            "mount target must be absolute",
        ));
    }
    let target = path::normalize(target);

    if MOUNTS.lock().iter().any(|m| m.path == target) {
        return Err(KernelError::with_context(
            ErrorKind::Exists,
            "target already mounted",
        ));
    }

    let fs = {
        let filesystems = FILESYSTEMS.lock();
        filesystems
            .iter()
            .find(|fs| fs.fstype() == fstype)
            .cloned()
            .ok_or(KernelError::with_context(
                ErrorKind::NotFound,
                "unknown filesystem type",
            ))?
    };

    let root = fs.mount(source)?;
    debug_println!("[VFS] mounted {} ({}) at {}", source, fstype, target);
    MOUNTS.lock().push(Mount {
        path: target,
        source: String::from(source),
        fstype: String::from(fstype),
        root,
    });
    Ok(())
}

/// マウントを解除する
///
/// ルート (`/`) は解除できない。
pub fn unmount(target: &str) -> KernelResult<()> {
    let target = path::normalize(target);
    if target == "/" {
        return Err(KernelError::with_context(
            ErrorKind::Permission,
            "cannot unmount root",
        ));
    }

    let mount = {
        let mut mounts = MOUNTS.lock();
        let index = mounts
            .iter()
            .position(|m| m.path == target)
            .ok_or(KernelError::new(ErrorKind::NotFound))?;
        mounts.remove(index)
    };

    let fs = {
        let filesystems = FILESYSTEMS.lock();
        filesystems
            .iter()
            .find(|fs| fs.fstype() == mount.fstype)
            .cloned()
    };
    if let Some(fs) = fs {
        fs.unmount(&mount.root);
    }
    debug_println!("[VFS] unmounted {}", mount.path);
    Ok(())
}

/// ファイルを開き、fd を返す
pub fn open(fds: &mut FdTable, raw_path: &str, flags: OpenFlags) -> KernelResult<usize> {
    let node = match resolve(raw_path) {
        Ok(node) => node,
        // 書き込み可能なファイルシステムが無いため CREAT は成立しない
        Err(e) => return Err(e),
    };

    if node.kind == NodeKind::Directory && flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR) {
        return Err(KernelError::with_context(
            ErrorKind::Permission,
            "directory opened for writing",
        ));
    }
    if flags.contains(OpenFlags::TRUNC) {
        return Err(KernelError::with_context(
            ErrorKind::Unsupported,
            "truncate on read-only filesystem",
        ));
    }

    node.open()?;
    fds.allocate(OpenFile {
        node,
        pos: 0,
        flags,
    })
}

/// fd を閉じる
pub fn close(fds: &mut FdTable, fd: usize) -> KernelResult<()> {
    let file = fds
        .take(fd)
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    file.node.close();
    Ok(())
}

/// fd から読み取る
pub fn read(fds: &mut FdTable, fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let file = fds
        .get_mut(fd)
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    if file.flags.contains(OpenFlags::WRONLY) {
        return Err(KernelError::new(ErrorKind::Permission));
    }
    if file.node.kind == NodeKind::Directory {
        return Err(KernelError::with_context(
            ErrorKind::Permission,
            "read on directory",
        ));
    }
    let n = file.node.read(file.pos, buf)?;
    file.pos += n as u32;
    Ok(n)
}

/// fd へ書き込む
pub fn write(fds: &mut FdTable, fd: usize, buf: &[u8]) -> KernelResult<usize> {
    let file = fds
        .get_mut(fd)
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    if file.flags.contains(OpenFlags::RDONLY) {
        return Err(KernelError::new(ErrorKind::Permission));
    }
    if file.flags.contains(OpenFlags::APPEND) {
        file.pos = file.node.length;
    }
    let n = file.node.write(file.pos, buf)?;
    file.pos += n as u32;
    Ok(n)
}

/// fd の位置を変更する
///
/// 結果が負になる seek は拒否する。
pub fn seek(fds: &mut FdTable, fd: usize, offset: i32, whence: u32) -> KernelResult<u32> {
    let file = fds
        .get_mut(fd)
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => i64::from(file.pos),
        SEEK_END => i64::from(file.node.length),
        _ => return Err(KernelError::new(ErrorKind::InvalidArgument)),
    };
    let new_pos = base + i64::from(offset);
    if new_pos < 0 {
        return Err(KernelError::with_context(
            ErrorKind::InvalidArgument,
            "negative seek",
        ));
    }
    file.pos = new_pos as u32;
    Ok(file.pos)
}

/// ディレクトリエントリを 1 件読む
///
/// fd の位置を子インデックスとして使い、終端では 0 を返す。
pub fn readdir(fds: &mut FdTable, fd: usize, entry: &mut Dirent) -> KernelResult<u32> {
    let file = fds
        .get_mut(fd)
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    if file.node.kind != NodeKind::Directory {
        return Err(KernelError::with_context(
            ErrorKind::Permission,
            "readdir on non-directory",
        ));
    }
    match file.node.readdir(file.pos)? {
        Some(child) => {
            entry.set_name(&child.name);
            entry.inode = child.inode;
            entry.kind = child.kind.mode_bits();
            file.pos += 1;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// パスの stat 情報を取る
pub fn stat(raw_path: &str, out: &mut Stat) -> KernelResult<()> {
    let node = resolve(raw_path)?;
    out.mode = node.kind.mode_bits();
    out.size = node.length;
    out.blocks = (node.length + 511) / 512;
    out.atime = 0;
    out.mtime = 0;
    out.ctime = 0;
    Ok(())
}

/// ディレクトリ作成（書き込み可能な fs が無いため常に失敗）
pub fn mkdir(raw_path: &str) -> KernelResult<()> {
    let _ = raw_path;
    Err(KernelError::new(ErrorKind::Unsupported))
}

/// ディレクトリ削除（書き込み可能な fs が無いため常に失敗）
pub fn rmdir(raw_path: &str) -> KernelResult<()> {
    let _ = raw_path;
    Err(KernelError::new(ErrorKind::Unsupported))
}

/// ファイル削除（書き込み可能な fs が無いため常に失敗）
pub fn unlink(raw_path: &str) -> KernelResult<()> {
    let _ = raw_path;
    Err(KernelError::new(ErrorKind::Unsupported))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! テスト用のメモリ内ファイルシステム

    use super::*;
    use crate::kernel::fs::{NodeOps, VfsNode};
    use alloc::string::ToString;
    use alloc::vec::Vec;

    /// (名前, 内容) の列からなる読み取り専用 fs
    pub struct RamFs {
        fstype: String,
        files: Vec<(String, Vec<u8>)>,
        nodes: Mutex<Vec<NodeRef>>,
        root: Mutex<Option<NodeRef>>,
    }

    const ROOT_HANDLE: u32 = u32::MAX;

    impl RamFs {
        pub fn new(fstype: &str, files: &[(&str, &[u8])]) -> Arc<Self> {
            let fs = Arc::new(Self {
                fstype: fstype.to_string(),
                files: files
                    .iter()
                    .map(|(n, d)| (n.to_string(), d.to_vec()))
                    .collect(),
                nodes: Mutex::new(Vec::new()),
                root: Mutex::new(None),
            });
            let nodes = fs
                .files
                .iter()
                .enumerate()
                .map(|(i, (name, data))| {
                    Arc::new(VfsNode::new(
                        name.clone(),
                        NodeKind::Regular,
                        data.len() as u32,
                        i as u32 + 1,
                        i as u32,
                        fs.clone() as Arc<dyn NodeOps>,
                    ))
                })
                .collect();
            *fs.nodes.lock() = nodes;
            *fs.root.lock() = Some(Arc::new(VfsNode::new(
                "/".to_string(),
                NodeKind::Directory,
                0,
                0,
                ROOT_HANDLE,
                fs.clone() as Arc<dyn NodeOps>,
            )));
            fs
        }
    }

    impl NodeOps for RamFs {
        fn read(&self, node: &VfsNode, offset: u32, buf: &mut [u8]) -> KernelResult<usize> {
            let data = &self.files[node.handle as usize].1;
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn readdir(&self, node: &VfsNode, index: u32) -> KernelResult<Option<NodeRef>> {
            if node.handle != ROOT_HANDLE {
                return Err(KernelError::new(ErrorKind::Unsupported));
            }
            Ok(self.nodes.lock().get(index as usize).cloned())
        }

        fn finddir(&self, node: &VfsNode, name: &str) -> KernelResult<Option<NodeRef>> {
            if node.handle != ROOT_HANDLE {
                return Err(KernelError::new(ErrorKind::Unsupported));
            }
            Ok(self
                .nodes
                .lock()
                .iter()
                .find(|n| n.name == name)
                .cloned())
        }
    }

    impl Filesystem for RamFs {
        fn fstype(&self) -> &str {
            &self.fstype
        }

        fn mount(&self, _source: &str) -> KernelResult<NodeRef> {
            Ok(self.root.lock().clone().expect("RamFs root missing"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RamFs;
    use super::*;

    // マウントテーブルはグローバルなのでテストを直列化する
    static VFS_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn setup_root() {
        clear_mounts();
        let root = RamFs::new("ramfs-root", &[("hello.txt", b"hi\n" as &[u8])]);
        register_filesystem(root);
        mount("ram0", "/", "ramfs-root").unwrap();
    }

    #[test]
    fn open_read_to_eof() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let mut fds = FdTable::new();

        let fd = open(&mut fds, "/hello.txt", OpenFlags::RDONLY).unwrap();
        assert!(fd >= 3);

        let mut buf = [0u8; 16];
        assert_eq!(read(&mut fds, fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
        assert_eq!(read(&mut fds, fd, &mut buf).unwrap(), 0);
        close(&mut fds, fd).unwrap();
    }

    #[test]
    fn resolution_ignores_duplicate_and_trailing_slashes() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        assert!(resolve("//hello.txt").is_ok());
        assert!(resolve("/hello.txt/").is_ok());
        assert!(resolve("/./hello.txt").is_ok());
        assert!(resolve("/missing").is_err());
        assert!(resolve("relative").is_err());
    }

    #[test]
    fn longest_prefix_mount_wins() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let second = RamFs::new("ramfs-mnt", &[("file", b"mnt contents" as &[u8])]);
        register_filesystem(second);

        // `/` しか無ければ /mnt/file は見つからない
        assert!(resolve("/mnt/file").is_err());

        mount("ram1", "/mnt", "ramfs-mnt").unwrap();
        let node = resolve("/mnt/file").unwrap();
        assert_eq!(node.name, "file");

        // /mn や /mntx には一致しない
        assert!(resolve("/mntx/file").is_err());

        unmount("/mnt").unwrap();
        assert!(resolve("/mnt/file").is_err());
    }

    #[test]
    fn mount_rejects_duplicates_and_root_unmount() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let err = mount("again", "/", "ramfs-root").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exists);
        let err = unmount("/").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn directory_write_and_flag_rules() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let mut fds = FdTable::new();

        assert!(open(&mut fds, "/", OpenFlags::WRONLY).is_err());
        let fd = open(&mut fds, "/hello.txt", OpenFlags::RDONLY).unwrap();
        assert!(write(&mut fds, fd, b"x").is_err());
        close(&mut fds, fd).unwrap();

        let fd = open(&mut fds, "/hello.txt", OpenFlags::WRONLY).unwrap();
        let mut buf = [0u8; 4];
        assert!(read(&mut fds, fd, &mut buf).is_err());
        close(&mut fds, fd).unwrap();
    }

    #[test]
    fn seek_arithmetic_and_bounds() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let mut fds = FdTable::new();
        let fd = open(&mut fds, "/hello.txt", OpenFlags::RDONLY).unwrap();

        assert_eq!(seek(&mut fds, fd, 1, SEEK_SET).unwrap(), 1);
        assert_eq!(seek(&mut fds, fd, 1, SEEK_CUR).unwrap(), 2);
        assert_eq!(seek(&mut fds, fd, -1, SEEK_END).unwrap(), 2);
        assert!(seek(&mut fds, fd, -10, SEEK_CUR).is_err());
        assert!(seek(&mut fds, fd, 0, 9).is_err());
        close(&mut fds, fd).unwrap();
    }

    #[test]
    fn readdir_walks_children_then_stops() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let mut fds = FdTable::new();
        let fd = open(&mut fds, "/", OpenFlags::RDONLY).unwrap();

        let mut entry = Dirent::zeroed();
        assert_eq!(readdir(&mut fds, fd, &mut entry).unwrap(), 1);
        assert_eq!(entry.name_str(), "hello.txt");
        assert_eq!(readdir(&mut fds, fd, &mut entry).unwrap(), 0);
        close(&mut fds, fd).unwrap();

        // finddir(readdir(dir, i)) は同じノードを返す
        let root = resolve("/").unwrap();
        let child = root.readdir(0).unwrap().unwrap();
        let found = root.finddir(&child.name).unwrap().unwrap();
        assert_eq!(child.inode, found.inode);
    }

    #[test]
    fn write_paths_fail_on_readonly_fs() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        assert!(mkdir("/newdir").is_err());
        assert!(rmdir("/newdir").is_err());
        assert!(unlink("/hello.txt").is_err());
        let mut fds = FdTable::new();
        assert!(open(&mut fds, "/hello.txt", OpenFlags::RDONLY | OpenFlags::TRUNC).is_err());
        assert!(open(&mut fds, "/brandnew", OpenFlags::RDONLY | OpenFlags::CREAT).is_err());
    }

    #[test]
    fn stat_reports_mode_and_blocks() {
        let _guard = VFS_TEST_LOCK.lock();
        setup_root();
        let mut st = Stat::default();
        stat("/hello.txt", &mut st).unwrap();
        assert_eq!(st.mode, 0x8000);
        assert_eq!(st.size, 3);
        assert_eq!(st.blocks, 1);
        stat("/", &mut st).unwrap();
        assert_eq!(st.mode, 0x4000);
    }
}
