//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};

/// Format a FAT image holding `files`; `dir/name` paths create the directories
pub fn fat_image(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut image = Cursor::new(vec![0u8; 8 * 1024 * 1024]);
    fatfs::format_volume(&mut image, FormatVolumeOptions::new()).unwrap();
    {
        let fs = FileSystem::new(&mut image, FsOptions::new()).unwrap();
        for (path, data) in files {
            let mut parts: Vec<&str> = path.split('/').collect();
            let name = parts.pop().unwrap();
            let mut dir = fs.root_dir();
            for part in parts {
                dir = match dir.open_dir(part) {
                    Ok(existing) => existing,
                    Err(_) => dir.create_dir(part).unwrap(),
                };
            }
            let mut file = dir.create_file(name).unwrap();
            file.truncate().unwrap();
            file.write_all(data).unwrap();
        }
        fs.unmount().unwrap();
    }
    image.into_inner()
}

/// Permission bits of a host path
pub fn mode_of(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}
