//! Sliding view over the tail of the packfile being written.
//!
//! Every byte appended to the pack also lands in a tail buffer covering the
//! last `window_size + 20` bytes, so objects written moments ago can be read
//! back (to serve as delta bases, or to reconstruct a delta parent) without
//! remapping the growing file. When the tail would overflow it slides
//! forward to the largest `window_size` multiple below the current end,
//! pinning a read-only window over the bytes it leaves behind; the two
//! overlap by 20 bytes so no object boundary falls in an unreachable gap.
//! Reads outside both buffers fall back to a positioned read of the flushed
//! file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

/// Overlap kept between the tail and the pinned window when sliding.
pub const WINDOW_OVERLAP: usize = 20;

struct Pinned {
    offset: u64,
    bytes: Vec<u8>,
}

/// The in-progress pack file plus its tail window.
pub struct PackWindow {
    file: File,
    window_size: usize,
    tail: Vec<u8>,
    tail_offset: u64,
    pinned: Option<Pinned>,
    size: u64,
}

impl PackWindow {
    /// Create the pack file and an empty tail window.
    pub fn create(path: &Path, window_size: usize) -> io::Result<PackWindow> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(PackWindow {
            file,
            window_size,
            tail: Vec::with_capacity(window_size + WINDOW_OVERLAP),
            tail_offset: 0,
            pinned: None,
            size: 0,
        })
    }

    /// Current pack size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn capacity(&self) -> usize {
        self.window_size + WINDOW_OVERLAP
    }

    /// Append bytes to the pack and the tail window, sliding if needed.
    /// Invariant between writes: `tail_offset + tail.len() == size`.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        if self.tail.len() + data.len() > self.capacity() {
            self.slide()?;
        } else {
            self.tail.extend_from_slice(data);
        }
        Ok(())
    }

    /// Move the tail forward to the largest `window_size` multiple below
    /// `size - 20`, pinning a read-only window over the range it vacates.
    fn slide(&mut self) -> io::Result<()> {
        let base = self.size - WINDOW_OVERLAP as u64;
        let new_offset = (base - 1) / self.window_size as u64 * self.window_size as u64;
        let pin_end = new_offset + WINDOW_OVERLAP as u64;
        let pin_start = pin_end.saturating_sub(self.capacity() as u64);
        debug!(
            pack_size = self.size,
            tail_offset = new_offset,
            pinned_start = pin_start,
            "pack window slide"
        );
        self.pinned = Some(Pinned {
            offset: pin_start,
            bytes: self.pread(pin_start, (pin_end - pin_start) as usize)?,
        });
        self.tail = self.pread(new_offset, (self.size - new_offset) as usize)?;
        self.tail_offset = new_offset;
        Ok(())
    }

    /// Read up to `len` bytes starting at `offset`, clamped to the pack end.
    /// Served from the tail window, the pinned window, or a positioned read.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let avail = self.size.saturating_sub(offset);
        let len = len.min(avail as usize);
        if len == 0 {
            return Ok(Vec::new());
        }
        if offset >= self.tail_offset {
            let start = (offset - self.tail_offset) as usize;
            return Ok(self.tail[start..start + len].to_vec());
        }
        if let Some(pinned) = &self.pinned
            && offset >= pinned.offset
            && offset + len as u64 <= pinned.offset + pinned.bytes.len() as u64
        {
            let start = (offset - pinned.offset) as usize;
            return Ok(pinned.bytes[start..start + len].to_vec());
        }
        self.pread(offset, len)
    }

    /// Overwrite already-written bytes (header fixups at finalization),
    /// keeping the in-memory windows coherent.
    pub fn rewrite_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.seek(SeekFrom::End(0))?;
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i as u64;
            if pos >= self.tail_offset {
                self.tail[(pos - self.tail_offset) as usize] = byte;
            }
            if let Some(pinned) = &mut self.pinned
                && pos >= pinned.offset
                && ((pos - pinned.offset) as usize) < pinned.bytes.len()
            {
                pinned.bytes[(pos - pinned.offset) as usize] = byte;
            }
        }
        Ok(())
    }

    fn pread(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(buf)
    }

    /// Hand the underlying file over for finalization.
    pub fn into_file(self) -> File {
        self.file
    }
}

/// A forward [`Read`] over the window starting at a pack offset; used to
/// feed the entry decoder without copying the whole remainder.
pub struct WindowReader<'a> {
    window: &'a mut PackWindow,
    pos: u64,
}

impl<'a> WindowReader<'a> {
    pub fn new(window: &'a mut PackWindow, pos: u64) -> WindowReader<'a> {
        WindowReader { window, pos }
    }
}

impl Read for WindowReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.window.read_at(self.pos, buf.len())?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.pos += chunk.len() as u64;
        Ok(chunk.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_window(window_size: usize) -> (tempfile::TempDir, PackWindow) {
        let dir = tempfile::tempdir().unwrap();
        let window = PackWindow::create(&dir.path().join("w.pack"), window_size).unwrap();
        (dir, window)
    }

    /// Small writes stay in the tail and read back verbatim.
    #[test]
    fn test_read_back_from_tail() {
        let (_dir, mut w) = temp_window(64);
        w.write(b"hello ").unwrap();
        w.write(b"world").unwrap();
        assert_eq!(w.size(), 11);
        assert_eq!(w.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(w.read_at(6, 5).unwrap(), b"world");
    }

    /// Writing past the capacity slides the tail; earlier bytes remain
    /// readable through the pinned window or the file.
    #[test]
    fn test_slide_keeps_all_offsets_readable() {
        let (_dir, mut w) = temp_window(32);
        let mut expect = Vec::new();
        for i in 0..40u8 {
            let chunk = [i; 7];
            w.write(&chunk).unwrap();
            expect.extend_from_slice(&chunk);
        }
        assert_eq!(w.size(), 280);
        for start in (0..280usize).step_by(13) {
            let len = 11usize.min(280 - start);
            assert_eq!(
                w.read_at(start as u64, len).unwrap(),
                &expect[start..start + len]
            );
        }
    }

    /// A single write larger than the whole window still lands and reads.
    #[test]
    fn test_oversized_write() {
        let (_dir, mut w) = temp_window(16);
        let big = vec![0xabu8; 100];
        w.write(&big).unwrap();
        assert_eq!(w.read_at(0, 100).unwrap(), big);
        assert_eq!(w.read_at(90, 100).unwrap(), vec![0xabu8; 10]);
    }

    /// Reads are clamped at the pack end.
    #[test]
    fn test_read_clamped() {
        let (_dir, mut w) = temp_window(64);
        w.write(b"abc").unwrap();
        assert_eq!(w.read_at(1, 10).unwrap(), b"bc");
        assert_eq!(w.read_at(5, 10).unwrap(), b"");
    }

    /// rewrite_at patches both the file and the in-memory windows.
    #[test]
    fn test_rewrite_at() {
        let (_dir, mut w) = temp_window(64);
        w.write(b"0123456789").unwrap();
        w.rewrite_at(2, b"XY").unwrap();
        assert_eq!(w.read_at(0, 10).unwrap(), b"01XY456789");
        // subsequent writes still append at the end
        w.write(b"Z").unwrap();
        assert_eq!(w.read_at(0, 11).unwrap(), b"01XY456789Z");
    }

    /// The window reader walks forward across buffer boundaries.
    #[test]
    fn test_window_reader() {
        let (_dir, mut w) = temp_window(32);
        let data: Vec<u8> = (0..=255u8).collect();
        w.write(&data).unwrap();
        let mut reader = WindowReader::new(&mut w, 100);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[100..]);
    }
}
