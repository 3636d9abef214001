use std::sync::Arc;

/// An open file. Contents and I/O live in the file system, which is a
/// collaborator of this crate; the core only tracks shared references:
/// duplication is an `Arc` clone, closing is dropping the reference.
pub struct File {
    pub kind: FileKind,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FileKind {
    Console,
}

impl File {
    pub(crate) fn console() -> Arc<File> {
        Arc::new(File {
            kind: FileKind::Console,
        })
    }
}

/// A directory entry handle, for the current working directory.
pub struct Inode;
