//! Provides a general interface to a physical OPC package (ZIP file).
//!
//! This module handles the low-level reading and writing of OPC packages as ZIP
//! archives. Members are addressed by PackURI; the leading slash is dropped to
//! form the archive member name.

use crate::opc::error::{OpcError, Result};
use crate::opc::packuri::{CONTENT_TYPES_URI, PackURI};
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Compression applied to each archive member on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Deflate every member (what Office writes)
    #[default]
    Deflated,

    /// Store members uncompressed
    Stored,
}

/// Options for writing a physical package.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub compression: Compression,
}

impl WriteOptions {
    pub fn stored() -> Self {
        Self {
            compression: Compression::Stored,
        }
    }

    fn file_options(self) -> SimpleFileOptions {
        let method = match self.compression {
            Compression::Deflated => CompressionMethod::Deflated,
            Compression::Stored => CompressionMethod::Stored,
        };
        SimpleFileOptions::default().compression_method(method)
    }
}

/// Physical package reader that provides access to parts in a ZIP-based OPC package.
pub struct PhysPkgReader<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl PhysPkgReader<BufReader<File>> {
    /// Open an OPC package from a file path.
    ///
    /// # Errors
    /// Returns an error if the file doesn't exist or isn't a valid ZIP file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(OpcError::PackageNotFound(path.display().to_string()));
        }

        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> PhysPkgReader<R> {
    /// Create a new PhysPkgReader over a seekable reader.
    pub fn new(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader)?;
        Ok(Self { archive })
    }

    /// Get the binary content for a part by its PackURI.
    pub fn blob_for(&mut self, pack_uri: &PackURI) -> Result<Vec<u8>> {
        let index = self
            .archive
            .index_for_name(pack_uri.membername())
            .ok_or_else(|| OpcError::PartNotFound(pack_uri.to_string()))?;

        let mut member = self.archive.by_index(index)?;
        let mut blob = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut blob)?;
        Ok(blob)
    }

    /// Get the [Content_Types].xml content.
    ///
    /// This is a required part of every OPC package that maps parts to content types.
    pub fn content_types_xml(&mut self) -> Result<Vec<u8>> {
        self.blob_for(&PackURI::new(CONTENT_TYPES_URI)?)
    }

    /// Get the relationships XML for a specific source URI.
    ///
    /// Returns None if the source has no relationships file.
    pub fn rels_xml_for(&mut self, source_uri: &PackURI) -> Result<Option<Vec<u8>>> {
        let rels_uri = source_uri.rels_uri()?;

        match self.blob_for(&rels_uri) {
            Ok(blob) => Ok(Some(blob)),
            Err(OpcError::PartNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get the number of members in the archive.
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    /// List all member names in the package.
    pub fn member_names(&self) -> Vec<String> {
        self.archive.file_names().map(String::from).collect()
    }

    /// Check if a specific member exists in the package.
    pub fn contains(&self, pack_uri: &PackURI) -> bool {
        self.archive.index_for_name(pack_uri.membername()).is_some()
    }
}

/// Physical package writer for creating OPC packages.
pub struct PhysPkgWriter<W: Write + Seek> {
    archive: ZipWriter<W>,
    options: SimpleFileOptions,
}

impl<W: Write + Seek> PhysPkgWriter<W> {
    /// Create a new package writer over `writer`.
    pub fn new(writer: W, options: WriteOptions) -> Self {
        Self {
            archive: ZipWriter::new(writer),
            options: options.file_options(),
        }
    }

    /// Write a part to the package under its membername.
    pub fn write(&mut self, pack_uri: &PackURI, blob: &[u8]) -> Result<()> {
        self.archive.start_file(pack_uri.membername(), self.options)?;
        self.archive.write_all(blob)?;
        Ok(())
    }

    /// Finish the archive and return the underlying writer.
    pub fn finish(self) -> Result<W> {
        Ok(self.archive.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_members(options: WriteOptions, members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = PhysPkgWriter::new(Cursor::new(Vec::new()), options);
        for (uri, blob) in members {
            writer.write(&PackURI::new(*uri).unwrap(), blob).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_round_trip() {
        let pack_uri = PackURI::new("/test.txt").unwrap();
        let zip_data =
            write_members(WriteOptions::default(), &[("/test.txt", &b"Hello, World!"[..])]);

        let mut reader = PhysPkgReader::new(Cursor::new(zip_data)).unwrap();
        assert_eq!(reader.blob_for(&pack_uri).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_multiple_parts() {
        let zip_data = write_members(
            WriteOptions::stored(),
            &[
                ("/[Content_Types].xml", &b"<Types/>"[..]),
                ("/_rels/.rels", &b"<Relationships/>"[..]),
                ("/ppt/presentation.xml", &b"<p:presentation/>"[..]),
            ],
        );
        let mut reader = PhysPkgReader::new(Cursor::new(zip_data)).unwrap();

        assert_eq!(reader.len(), 3);
        assert!(reader.contains(&PackURI::new("/_rels/.rels").unwrap()));
        assert!(reader.member_names().contains(&"ppt/presentation.xml".to_string()));
        assert_eq!(reader.content_types_xml().unwrap(), b"<Types/>");
        assert_eq!(
            reader.rels_xml_for(&PackURI::package()).unwrap().as_deref(),
            Some(&b"<Relationships/>"[..])
        );
    }

    #[test]
    fn test_missing_members() {
        let zip_data = write_members(WriteOptions::default(), &[("/a.xml", &b"<a/>"[..])]);
        let mut reader = PhysPkgReader::new(Cursor::new(zip_data)).unwrap();
        let partname = PackURI::new("/b.xml").unwrap();

        assert!(!reader.contains(&partname));
        assert!(matches!(reader.blob_for(&partname), Err(OpcError::PartNotFound(_))));
        assert!(reader.rels_xml_for(&partname).unwrap().is_none());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = PhysPkgReader::open(dir.path().join("nope.pptx"));
        assert!(matches!(result, Err(OpcError::PackageNotFound(_))));
    }

    #[test]
    fn test_not_a_zip() {
        let result = PhysPkgReader::new(Cursor::new(b"definitely not a zip".to_vec()));
        assert!(matches!(result, Err(OpcError::ZipError(_))));
    }
}
