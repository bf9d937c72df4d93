//! Binary executable images for the demo.
//!
//! A header followed by the raw pages of every section, in section order.
//! All fields are little-endian `u64`.
//!
//! | field                     | size                   |
//! |---------------------------|------------------------|
//! | section count `n`         | 8 bytes                |
//! | page size                 | 8 bytes                |
//! | section table             | n * 24 bytes           |
//! | section pages             | sum(page counts) pages |
//!
//! Each section table row is `first_vpn`, `page_count`, `read_only` (0 or 1).

use std::{
    fs::File,
    io::{self, BufReader, ErrorKind, Read},
    path::Path,
};

use vm::page_loader::{ExecutableImage, ImageSection};

struct SectionHeader {
    first_vpn: usize,
    page_count: usize,
    read_only: bool,
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_usize<R: Read>(reader: &mut R) -> io::Result<usize> {
    usize::try_from(read_u64(reader)?)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "field does not fit in usize"))
}

/// Parses an image whose pages must be `page_size` bytes wide.
pub fn parse_image<R: Read>(reader: &mut R, page_size: usize) -> io::Result<ExecutableImage> {
    let n_sections = read_usize(reader)?;

    let file_page_size = read_usize(reader)?;
    if file_page_size != page_size {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("image built for {}-byte pages, kernel uses {}", file_page_size, page_size),
        ));
    }

    // the count is untrusted; let the reader run dry instead of preallocating
    let mut headers = Vec::new();
    for _ in 0..n_sections {
        headers.push(SectionHeader {
            first_vpn: read_usize(reader)?,
            page_count: read_usize(reader)?,
            read_only: read_u64(reader)? != 0,
        });
    }

    let mut image = ExecutableImage::new();
    for (i, header) in headers.into_iter().enumerate() {
        let len = header
            .page_count
            .checked_mul(page_size)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, format!("section{} is too large", i)))?;

        let mut data = Vec::new();
        reader.by_ref().take(len as u64).read_to_end(&mut data)?;
        if data.len() != len {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("section{} truncated: {} of {} bytes", i, data.len(), len),
            ));
        }

        image.push(Box::new(ImageSection::new(
            format!("section{}", i),
            header.first_vpn,
            header.page_count,
            header.read_only,
            page_size,
            data,
        )));
    }

    Ok(image)
}

pub fn load_image<P: AsRef<Path>>(path: P, page_size: usize) -> io::Result<ExecutableImage> {
    let mut reader = BufReader::new(File::open(path)?);
    parse_image(&mut reader, page_size)
}
