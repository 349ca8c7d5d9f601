use chrono::{DateTime, Utc};

pub const MODE_DIR_WRITABLE: u32 = 0o40777;
pub const MODE_DIR_READONLY: u32 = 0o40444;
pub const MODE_FILE_WRITABLE: u32 = 0o100666;
pub const MODE_FILE_READONLY: u32 = 0o100444;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// POSIX-like attributes of a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
}

impl FileStat {
    pub fn directory(writable: bool) -> Self {
        Self {
            mode: if writable {
                MODE_DIR_WRITABLE
            } else {
                MODE_DIR_READONLY
            },
            size: 0,
            mtime: None,
            ctime: None,
        }
    }

    pub fn file(writable: bool, size: u64) -> Self {
        Self {
            mode: if writable {
                MODE_FILE_WRITABLE
            } else {
                MODE_FILE_READONLY
            },
            size,
            mtime: None,
            ctime: None,
        }
    }

    pub fn with_times(mut self, mtime: Option<DateTime<Utc>>, ctime: Option<DateTime<Utc>>) -> Self {
        self.mtime = mtime;
        self.ctime = ctime;
        self
    }

    pub fn kind(&self) -> FileType {
        if self.mode & S_IFMT == S_IFDIR {
            FileType::Dir
        } else {
            FileType::File
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileType::Dir
    }

    pub fn is_writable(&self) -> bool {
        self.mode & 0o222 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        assert!(FileStat::directory(true).is_dir());
        assert!(!FileStat::directory(false).is_writable());
        let f = FileStat::file(true, 10);
        assert_eq!(f.kind(), FileType::File);
        assert_eq!(f.mode, 0o100666);
        assert!(!FileStat::file(false, 0).is_writable());
    }
}
