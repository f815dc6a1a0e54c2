//! newc (`070701`) cpio writer.
//!
//! Writes archives the kernel unpacks as an initramfs. Metadata is canonical
//! (mtime 0, uid/gid 0, sequential inode numbers, nlink 1) so the same input
//! tree always produces the same bytes.

use anyhow::{bail, Context, Result};
use std::io::{self, Read, Write};

const MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";
const HEADER_LEN: u64 = 110;
const BLOCK: u64 = 512;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Streaming newc archive writer.
pub struct NewcWriter<W: Write> {
    out: W,
    written: u64,
    next_ino: u32,
}

impl<W: Write> NewcWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            written: 0,
            next_ino: 1,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn append_dir(&mut self, name: &str, perm: u32) -> Result<()> {
        let ino = self.take_ino();
        self.header(ino, S_IFDIR | (perm & 0o7777), name, 0, (0, 0))
    }

    /// Append a regular file of exactly `size` bytes read from `data`.
    pub fn append_file(&mut self, name: &str, perm: u32, size: u64, data: impl Read) -> Result<()> {
        if size > u32::MAX as u64 {
            bail!("{} is too large for a newc archive ({} bytes)", name, size);
        }
        let ino = self.take_ino();
        self.header(ino, S_IFREG | (perm & 0o7777), name, size, (0, 0))?;

        let copied = io::copy(&mut data.take(size), &mut self.out)
            .with_context(|| format!("writing {} to archive", name))?;
        if copied != size {
            bail!("{} changed while archiving ({} of {} bytes)", name, copied, size);
        }
        self.written += copied;
        self.pad(4)
    }

    pub fn append_symlink(&mut self, name: &str, target: &str) -> Result<()> {
        let ino = self.take_ino();
        let len = target.len() as u64;
        self.header(ino, S_IFLNK | 0o777, name, len, (0, 0))?;
        self.raw(target.as_bytes())?;
        self.pad(4)
    }

    /// Append a device node or fifo. `mode` carries the file type bits.
    pub fn append_special(&mut self, name: &str, mode: u32, rdev: u64) -> Result<()> {
        let ino = self.take_ino();
        self.header(ino, mode, name, 0, split_dev(rdev))
    }

    /// Write the trailer, pad to a 512-byte boundary and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.header(0, 0, TRAILER, 0, (0, 0))?;
        self.pad(BLOCK)?;
        self.out.flush().context("flushing archive")?;
        Ok(self.out)
    }

    fn take_ino(&mut self) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn header(&mut self, ino: u32, mode: u32, name: &str, size: u64, rdev: (u32, u32)) -> Result<()> {
        let namesize = name.len() as u64 + 1;
        let header = format!(
            "{}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            MAGIC,
            ino,
            mode,
            0, // uid
            0, // gid
            1, // nlink
            0, // mtime
            size,
            0, // devmajor
            0, // devminor
            rdev.0,
            rdev.1,
            namesize,
            0, // check
        );
        debug_assert_eq!(header.len() as u64, HEADER_LEN);
        self.raw(header.as_bytes())?;
        self.raw(name.as_bytes())?;
        self.raw(&[0])?;
        self.pad(4)
    }

    fn raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes).context("writing archive")?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn pad(&mut self, align: u64) -> Result<()> {
        let rem = self.written % align;
        if rem != 0 {
            let zeros = vec![0u8; (align - rem) as usize];
            self.raw(&zeros)?;
        }
        Ok(())
    }
}

/// Split a Linux `dev_t` into (major, minor).
fn split_dev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as u32, minor as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(header: &[u8], index: usize) -> u32 {
        let start = 6 + index * 8;
        let s = std::str::from_utf8(&header[start..start + 8]).unwrap();
        u32::from_str_radix(s, 16).unwrap()
    }

    #[test]
    fn test_single_file_layout() {
        let mut w = NewcWriter::new(Vec::new());
        w.append_file("init", 0o755, 5, &b"hello"[..]).unwrap();
        let bytes = w.finish().unwrap();

        assert_eq!(&bytes[..6], b"070701");
        assert_eq!(field(&bytes, 0), 1); // ino
        assert_eq!(field(&bytes, 1), 0o100755);
        assert_eq!(field(&bytes, 4), 1); // nlink
        assert_eq!(field(&bytes, 5), 0); // mtime
        assert_eq!(field(&bytes, 6), 5); // filesize
        assert_eq!(field(&bytes, 11), 5); // namesize "init\0"

        // 110 + 5 = 115, padded to 116
        assert_eq!(&bytes[110..115], b"init\0");
        assert_eq!(&bytes[116..121], b"hello");
        assert_eq!(bytes.len() % 512, 0);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("TRAILER!!!"));
    }

    #[test]
    fn test_symlink_and_dir() {
        let mut w = NewcWriter::new(Vec::new());
        w.append_dir(".", 0o755).unwrap();
        w.append_symlink("init", "/usr/bin/immucore").unwrap();
        let bytes = w.finish().unwrap();

        assert_eq!(field(&bytes, 1), 0o040755);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/usr/bin/immucore"));
    }

    #[test]
    fn test_deterministic() {
        let build = || {
            let mut w = NewcWriter::new(Vec::new());
            w.append_dir("etc", 0o755).unwrap();
            w.append_file("etc/hostname", 0o644, 6, &b"kairos"[..]).unwrap();
            w.finish().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_short_read_rejected() {
        let mut w = NewcWriter::new(Vec::new());
        assert!(w.append_file("f", 0o644, 10, &b"abc"[..]).is_err());
    }

    #[test]
    fn test_split_dev() {
        // /dev/null is 1:3, /dev/ttyS0 is 4:64
        assert_eq!(split_dev(0x0103), (1, 3));
        assert_eq!(split_dev(0x0440), (4, 64));
    }
}
