// src/kernel/core/result.rs
//! カーネル共通エラーハンドリング
//!
//! コンテキスト情報付きエラーで、デバッグを容易にします。
//! ユーザーに見えるパスでは syscall 境界がすべて -1 に潰します。

use core::fmt;

/// カーネル Result 型
pub type KernelResult<T> = Result<T, KernelError>;

/// カーネルエラー（コンテキスト情報付き）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError {
    kind: ErrorKind,
    context: Option<&'static str>,
}

impl KernelError {
    /// 新しいエラーを作成
    #[inline]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// コンテキスト情報付きエラーを作成
    #[inline]
    pub const fn with_context(kind: ErrorKind, ctx: &'static str) -> Self {
        Self {
            kind,
            context: Some(ctx),
        }
    }

    /// エラー種類を取得
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// コンテキストを取得
    #[inline]
    pub const fn context(&self) -> Option<&'static str> {
        self.context
    }
}

impl From<ErrorKind> for KernelError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// エラー種類
///
/// カーネル内の失敗分類。syscall 境界ではどの種類も -1 になる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// ヌルポインタ、範囲外ディスクリプタ、未知の syscall 番号
    InvalidArgument,
    /// パス・デバイス・pid・マウント対象が存在しない
    NotFound,
    /// オープンモードとノード種別の不一致、読み取り専用 fd への書き込みなど
    Permission,
    /// マウント対象が既にマウント済み
    Exists,
    /// fd / フレーム / プロセスの枯渇
    Exhausted,
    /// ドライバ op 未定義、fs op 未実装
    Unsupported,
    /// ヒープマジック不一致、不正な実行ファイルヘッダ
    Corrupt,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::InvalidArgument => write!(f, "invalid argument")?,
            ErrorKind::NotFound => write!(f, "not found")?,
            ErrorKind::Permission => write!(f, "operation not permitted")?,
            ErrorKind::Exists => write!(f, "already exists")?,
            ErrorKind::Exhausted => write!(f, "resource exhausted")?,
            ErrorKind::Unsupported => write!(f, "operation not supported")?,
            ErrorKind::Corrupt => write!(f, "corrupted data")?,
        }
        if let Some(ctx) = self.context {
            write!(f, " ({ctx})")?;
        }
        Ok(())
    }
}
