// src/capsule/cpio.rs

//! newc cpio archives, the payload format of RPM packages

use std::io::{self, Read};

/// Fixed newc header size
const HEADER_SIZE: usize = 110;
const MAGIC_NEWC: &[u8] = b"070701";
const MAGIC_CRC: &[u8] = b"070702";
const TRAILER: &str = "TRAILER!!!";

/// Archive member metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    /// Member name; RPM payloads use `./usr/bin/foo`
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

impl CpioEntry {
    /// The member name as an absolute path
    pub fn path(&self) -> String {
        let trimmed = self.name.trim_start_matches("./").trim_start_matches('/');
        format!("/{}", trimmed)
    }
}

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

pub struct CpioReader<R: Read> {
    reader: R,
}

impl<R: Read> CpioReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// The next member and its data; `None` at the trailer or end of input
    pub fn next_entry(&mut self) -> io::Result<Option<(CpioEntry, Vec<u8>)>> {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut header) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }

        let magic = &header[0..6];
        if magic != MAGIC_NEWC && magic != MAGIC_CRC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid cpio magic {:?}", String::from_utf8_lossy(magic)),
            ));
        }

        let field = |start: usize| -> io::Result<u32> {
            let s = std::str::from_utf8(&header[start..start + 8])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            u32::from_str_radix(s, 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };

        let mode = field(14)?;
        let uid = field(22)?;
        let gid = field(30)?;
        let nlink = field(38)?;
        let mtime = u64::from(field(46)?);
        let size = u64::from(field(54)?);
        let rdev_major = field(78)?;
        let rdev_minor = field(86)?;
        let namesize = field(94)? as usize;

        let mut name_buf = vec![0u8; namesize];
        self.reader.read_exact(&mut name_buf)?;
        if name_buf.last() == Some(&0) {
            name_buf.pop();
        }
        let name = String::from_utf8_lossy(&name_buf).into_owned();
        if name == TRAILER {
            return Ok(None);
        }
        self.skip(pad4(HEADER_SIZE + namesize))?;

        let mut content = vec![0u8; size as usize];
        self.reader.read_exact(&mut content)?;
        self.skip(pad4(size as usize))?;

        Ok(Some((
            CpioEntry {
                name,
                size,
                mode,
                mtime,
                uid,
                gid,
                nlink,
                rdev_major,
                rdev_minor,
            },
            content,
        )))
    }

    fn skip(&mut self, n: usize) -> io::Result<()> {
        let mut buf = [0u8; 3];
        self.reader.read_exact(&mut buf[..n])
    }
}

/// Writes newc archives
#[cfg(test)]
pub struct CpioWriter<W: io::Write> {
    out: W,
    ino: u32,
}

#[cfg(test)]
impl<W: io::Write> CpioWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, ino: 0 }
    }

    /// Append one member; `data` is empty for directories and holds the
    /// target of a symlink
    pub fn append(&mut self, name: &str, mode: u32, mtime: u32, data: &[u8]) -> io::Result<()> {
        self.ino += 1;
        self.write_header(self.ino, name, mode, mtime, data.len() as u32)?;
        self.out.write_all(data)?;
        self.out.write_all(&[0u8; 3][..pad4(data.len())])
    }

    /// Write the trailer and hand back the sink
    pub fn finish(mut self) -> io::Result<W> {
        self.write_header(0, TRAILER, 0, 0, 0)?;
        Ok(self.out)
    }

    fn write_header(&mut self, ino: u32, name: &str, mode: u32, mtime: u32, size: u32) -> io::Result<()> {
        let namesize = name.len() + 1;
        let nlink = if mode & 0o170000 == 0o040000 { 2 } else { 1 };
        let fields = [
            ino, mode, 0, 0, nlink, mtime, size, 0, 0, 0, 0, namesize as u32, 0,
        ];
        let mut header = String::with_capacity(HEADER_SIZE);
        header.push_str("070701");
        for f in fields {
            header.push_str(&format!("{:08x}", f));
        }
        self.out.write_all(header.as_bytes())?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&[0])?;
        self.out.write_all(&[0u8; 3][..pad4(HEADER_SIZE + namesize)])
    }
}
