//! Synchronous filesystem primitives for the guest `fs` module.
//!
//! The callback and promise flavours are built in JS on top of these.
//! Errors carry Node-style codes (`ENOENT: no such file or directory, open 'x'`).

use super::OpError;
use super::encoding::{binary_to_bytes, bytes_to_binary};
use rquickjs::{Ctx, Function, Object};
use serde::Serialize;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

fn fs_error(err: io::Error, syscall: &'static str, path: &str) -> OpError {
    let (code, description) = match err.kind() {
        ErrorKind::NotFound => ("ENOENT", "no such file or directory".to_string()),
        ErrorKind::PermissionDenied => ("EACCES", "permission denied".to_string()),
        ErrorKind::AlreadyExists => ("EEXIST", "file already exists".to_string()),
        ErrorKind::DirectoryNotEmpty => ("ENOTEMPTY", "directory not empty".to_string()),
        ErrorKind::NotADirectory => ("ENOTDIR", "not a directory".to_string()),
        ErrorKind::IsADirectory => ("EISDIR", "illegal operation on a directory".to_string()),
        _ => ("EIO", err.to_string()),
    };
    OpError::Fs {
        code,
        description,
        syscall,
        path: path.to_string(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatInfo {
    pub size: u64,
    pub mode: u32,
    pub is_file: bool,
    pub is_directory: bool,
    pub is_symbolic_link: bool,
    pub atime_ms: f64,
    pub mtime_ms: f64,
    pub ctime_ms: f64,
    pub birthtime_ms: f64,
}

fn millis(time: io::Result<SystemTime>) -> f64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o040755,
        (false, true) => 0o100444,
        (false, false) => 0o100666,
    }
}

pub fn read_file(path: &str) -> Result<Vec<u8>, OpError> {
    fs::read(path).map_err(|e| fs_error(e, "open", path))
}

pub fn write_file(path: &str, data: &[u8], append: bool) -> Result<(), OpError> {
    if append {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| fs_error(e, "open", path))?;
        file.write_all(data).map_err(|e| fs_error(e, "write", path))
    } else {
        fs::write(path, data).map_err(|e| fs_error(e, "open", path))
    }
}

pub fn stat(path: &str, follow_links: bool) -> Result<StatInfo, OpError> {
    let meta = if follow_links {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
    .map_err(|e| fs_error(e, if follow_links { "stat" } else { "lstat" }, path))?;

    Ok(StatInfo {
        size: meta.len(),
        mode: mode_of(&meta),
        is_file: meta.is_file(),
        is_directory: meta.is_dir(),
        is_symbolic_link: meta.file_type().is_symlink(),
        atime_ms: millis(meta.accessed()),
        mtime_ms: millis(meta.modified()),
        ctime_ms: millis(meta.modified()),
        birthtime_ms: millis(meta.created()),
    })
}

pub fn read_dir(path: &str) -> Result<Vec<String>, OpError> {
    let mut names = fs::read_dir(path)
        .map_err(|e| fs_error(e, "scandir", path))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

pub fn mkdir(path: &str, recursive: bool) -> Result<(), OpError> {
    let result = if recursive {
        fs::create_dir_all(path)
    } else {
        fs::create_dir(path)
    };
    result.map_err(|e| fs_error(e, "mkdir", path))
}

pub fn rm(path: &str, recursive: bool, force: bool) -> Result<(), OpError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if force && e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(fs_error(e, "rm", path)),
    };
    let result = match (meta.is_dir(), recursive) {
        (true, true) => fs::remove_dir_all(path),
        (true, false) => Err(io::Error::from(ErrorKind::IsADirectory)),
        (false, _) => fs::remove_file(path),
    };
    result.map_err(|e| fs_error(e, "rm", path))
}

pub(crate) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "fsReadFile",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String| -> rquickjs::Result<String> {
            let bytes = read_file(&path).map_err(|e| super::throw(&ctx, e))?;
            Ok(bytes_to_binary(&bytes))
        })?,
    )?;

    host.set(
        "fsWriteFile",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, path: String, data: String, append: bool| -> rquickjs::Result<()> {
                write_file(&path, &binary_to_bytes(&data), append).map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    host.set(
        "fsExists",
        Function::new(ctx.clone(), |path: String| Path::new(&path).exists())?,
    )?;

    host.set(
        "fsStat",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, path: String, follow_links: bool| -> rquickjs::Result<String> {
                let info = stat(&path, follow_links).map_err(|e| super::throw(&ctx, e))?;
                serde_json::to_string(&info).map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    host.set(
        "fsReaddir",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String| -> rquickjs::Result<Vec<String>> {
            read_dir(&path).map_err(|e| super::throw(&ctx, e))
        })?,
    )?;

    host.set(
        "fsMkdir",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, path: String, recursive: bool| -> rquickjs::Result<()> {
                mkdir(&path, recursive).map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    host.set(
        "fsRm",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, path: String, recursive: bool, force: bool| -> rquickjs::Result<()> {
                rm(&path, recursive, force).map_err(|e| super::throw(&ctx, e))
            },
        )?,
    )?;

    host.set(
        "fsRmdir",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String| -> rquickjs::Result<()> {
            fs::remove_dir(&path).map_err(|e| super::throw(&ctx, fs_error(e, "rmdir", &path)))
        })?,
    )?;

    host.set(
        "fsUnlink",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String| -> rquickjs::Result<()> {
            fs::remove_file(&path).map_err(|e| super::throw(&ctx, fs_error(e, "unlink", &path)))
        })?,
    )?;

    host.set(
        "fsRename",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, from: String, to: String| -> rquickjs::Result<()> {
                fs::rename(&from, &to).map_err(|e| super::throw(&ctx, fs_error(e, "rename", &from)))
            },
        )?,
    )?;

    host.set(
        "fsCopyFile",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, from: String, to: String| -> rquickjs::Result<()> {
                fs::copy(&from, &to)
                    .map(|_| ())
                    .map_err(|e| super::throw(&ctx, fs_error(e, "copyfile", &from)))
            },
        )?,
    )?;

    host.set(
        "fsRealpath",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String| -> rquickjs::Result<String> {
            fs::canonicalize(&path)
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(|e| super::throw(&ctx, fs_error(e, "realpath", &path)))
        })?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_append() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        let path = file.to_str().unwrap();

        write_file(path, b"hello", false).unwrap();
        write_file(path, b" world", true).unwrap();
        assert_eq!(read_file(path).unwrap(), b"hello world");

        let info = stat(path, true).unwrap();
        assert!(info.is_file);
        assert_eq!(info.size, 11);
    }

    #[test]
    fn test_missing_file_has_node_code() {
        let err = read_file("/definitely/not/here.txt").unwrap_err();
        assert_eq!(
            err.to_string(),
            "ENOENT: no such file or directory, open '/definitely/not/here.txt'"
        );
    }

    #[test]
    fn test_mkdir_readdir_rm() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("x/y");
        let nested = nested.to_str().unwrap();
        mkdir(nested, true).unwrap();
        write_file(&format!("{nested}/b.txt"), b"", false).unwrap();
        write_file(&format!("{nested}/a.txt"), b"", false).unwrap();
        assert_eq!(read_dir(nested).unwrap(), vec!["a.txt", "b.txt"]);

        let root = dir.path().join("x");
        let root = root.to_str().unwrap();
        assert!(rm(root, false, false).is_err());
        rm(root, true, false).unwrap();
        assert!(!Path::new(root).exists());
        rm(root, true, true).unwrap();
    }
}
